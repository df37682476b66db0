//! Mount-time configuration, parsed from the comma-separated option string
//! described in the external-interfaces section of the design: `debug`,
//! `hard_remove`, `use_ino`, `allow_root`, `readdir_ino`.

/// Options controlling dispatcher and hidden-rename behavior.
///
/// Unlike `fuser::MountOption` (which configures the kernel mount), these
/// options only affect how this crate's `Router` behaves once requests are
/// already arriving.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Config {
    /// Verbose tracing of every request and reply via `log::debug!`.
    pub debug: bool,

    /// Disable hide-on-busy-unlink; unlinks are unconditional and the user's
    /// `unlink`/`rmdir` is called immediately even if the target is open.
    pub hard_remove: bool,

    /// Trust inode numbers supplied by the user's `getattr`/`readdir`
    /// instead of overriding them with the synthesized node id.
    pub use_ino: bool,

    /// Restrict access to the filesystem owner and root.
    pub allow_root: bool,

    /// Populate inode numbers in readdir entries by consulting the node
    /// table when the user callback did not supply one.
    pub readdir_ino: bool,
}

impl Config {
    /// Parses a comma-separated option string, e.g. `"debug,allow_root"`.
    /// Unknown tokens are ignored (logged at `warn` level) rather than
    /// rejected, so that option strings shared with unrelated mount helpers
    /// don't break construction.
    pub fn parse(options: &str) -> Config {
        let mut config = Config::default();
        for token in options.split(',') {
            let token = token.trim();
            match token {
                "" => {}
                "debug" => config.debug = true,
                "hard_remove" => config.hard_remove = true,
                "use_ino" => config.use_ino = true,
                "allow_root" => config.allow_root = true,
                "readdir_ino" => config.readdir_ino = true,
                other => log::warn!("unrecognized fuse_path_core option: {other}"),
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_is_all_defaults() {
        assert_eq!(Config::parse(""), Config::default());
    }

    #[test]
    fn parses_every_known_flag() {
        let config = Config::parse("debug,hard_remove,use_ino,allow_root,readdir_ino");
        assert!(config.debug);
        assert!(config.hard_remove);
        assert!(config.use_ino);
        assert!(config.allow_root);
        assert!(config.readdir_ino);
    }

    #[test]
    fn tolerates_whitespace_and_unknown_tokens() {
        let config = Config::parse(" debug , bogus_flag ,allow_root");
        assert!(config.debug);
        assert!(config.allow_root);
        assert!(!config.hard_remove);
    }
}
