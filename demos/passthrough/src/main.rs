//! A thin mirror filesystem: every pathname operation is forwarded to the
//! equivalent call against a real directory on the host. Exists to exercise
//! `fuse_path_core::Router` end-to-end against a backing store with real
//! inode numbers, real open file descriptors, and real directory entries,
//! rather than a fake in-memory one.
//!
//! Deliberately thin: this binary owns CLI parsing, mount options, and
//! translating `std::fs`/`std::os::unix::fs` calls into the shapes
//! `fuse_path_core::PathnameFilesystem` expects. Everything about node ids,
//! the hidden-rename dance, and directory-read buffering lives in the core
//! crate, not here.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use clap::{Arg, ArgAction, Command};
use fuser::{FileAttr, FileType, MountOption};
use fuse_path_core::{Attr, Config, DirEntry, DirEntrySink, Entry, PathnameFilesystem, RequestInfo, Statfs};

const TTL: Duration = Duration::from_secs(1);

fn as_file_type(mode: u32) -> FileType {
    match mode & libc::S_IFMT as u32 {
        m if m == libc::S_IFREG as u32 => FileType::RegularFile,
        m if m == libc::S_IFDIR as u32 => FileType::Directory,
        m if m == libc::S_IFLNK as u32 => FileType::Symlink,
        m if m == libc::S_IFIFO as u32 => FileType::NamedPipe,
        m if m == libc::S_IFSOCK as u32 => FileType::Socket,
        m if m == libc::S_IFBLK as u32 => FileType::BlockDevice,
        m if m == libc::S_IFCHR as u32 => FileType::CharDevice,
        _ => FileType::RegularFile,
    }
}

fn attr_from_metadata(meta: &fs::Metadata) -> FileAttr {
    FileAttr {
        ino: meta.ino(),
        size: meta.size(),
        blocks: meta.blocks(),
        atime: meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
        mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        ctime: SystemTime::UNIX_EPOCH + Duration::from_secs(meta.ctime().max(0) as u64),
        crtime: meta.created().unwrap_or(SystemTime::UNIX_EPOCH),
        kind: as_file_type(meta.mode()),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    }
}

/// Mirrors a real directory tree. Open file handles are kept in a table
/// keyed by the synthetic `fh` the core hands back to the kernel, since
/// `PathnameFilesystem` identifies objects by path, not by the `File`
/// itself.
struct Passthrough {
    root: PathBuf,
    handles: Mutex<HashMap<u64, File>>,
    next_fh: AtomicU64,
}

impl Passthrough {
    fn new(root: PathBuf) -> Passthrough {
        Passthrough {
            root,
            handles: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
        }
    }

    /// Maps a core-supplied absolute path (always rooted at `/`) onto the
    /// corresponding path under the mirrored directory.
    fn real_path(&self, path: &Path) -> PathBuf {
        match path.strip_prefix("/") {
            Ok(rel) if rel.as_os_str().is_empty() => self.root.clone(),
            Ok(rel) => self.root.join(rel),
            Err(_) => self.root.join(path),
        }
    }

    fn take_fh(&self, file: File) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().unwrap().insert(fh, file);
        fh
    }

    fn io_errno(err: &std::io::Error) -> i32 {
        err.raw_os_error().unwrap_or(libc::EIO)
    }
}

impl PathnameFilesystem for Passthrough {
    fn getattr(&self, _req: &RequestInfo, path: &Path) -> Result<Attr, i32> {
        let meta = fs::symlink_metadata(self.real_path(path)).map_err(|e| Self::io_errno(&e))?;
        Ok(Attr {
            attr: attr_from_metadata(&meta),
            ttl: TTL,
        })
    }

    fn chmod(&self, _req: &RequestInfo, path: &Path, mode: u32) -> Result<(), i32> {
        fs::set_permissions(self.real_path(path), fs::Permissions::from_mode(mode))
            .map_err(|e| Self::io_errno(&e))
    }

    fn chown(
        &self,
        _req: &RequestInfo,
        path: &Path,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> Result<(), i32> {
        let real = self.real_path(path);
        let c_path = std::ffi::CString::new(real.as_os_str().as_bytes()).map_err(|_| libc::EINVAL)?;
        let uid = uid.map(|u| u as libc::uid_t).unwrap_or(u32::MAX as libc::uid_t);
        let gid = gid.map(|g| g as libc::gid_t).unwrap_or(u32::MAX as libc::gid_t);
        let rc = unsafe { libc::chown(c_path.as_ptr(), uid, gid) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
        }
        Ok(())
    }

    fn truncate(&self, _req: &RequestInfo, path: &Path, size: u64) -> Result<(), i32> {
        let file = OpenOptions::new()
            .write(true)
            .open(self.real_path(path))
            .map_err(|e| Self::io_errno(&e))?;
        file.set_len(size).map_err(|e| Self::io_errno(&e))
    }

    /// Best-effort only: a backing store that can't set times independently
    /// is not treated as fatal, and the dispatcher only calls this once both
    /// atime and mtime have been requested (§4.4's "jointly" ordering).
    fn utime(
        &self,
        _req: &RequestInfo,
        path: &Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<(), i32> {
        let real = self.real_path(path);
        let to_timespec = |t: SystemTime| -> libc::timespec {
            let dur = t
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or(Duration::ZERO);
            libc::timespec {
                tv_sec: dur.as_secs() as libc::time_t,
                tv_nsec: dur.subsec_nanos() as libc::c_long,
            }
        };
        let times = [
            atime.map(to_timespec).unwrap_or(libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_OMIT,
            }),
            mtime.map(to_timespec).unwrap_or(libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_OMIT,
            }),
        ];
        let c_path = std::ffi::CString::new(real.as_os_str().as_bytes()).map_err(|_| libc::EINVAL)?;
        let rc = unsafe { libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), 0) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
        }
        Ok(())
    }

    fn readlink(&self, _req: &RequestInfo, path: &Path) -> Result<Vec<u8>, i32> {
        let target = fs::read_link(self.real_path(path)).map_err(|e| Self::io_errno(&e))?;
        Ok(target.into_os_string().into_vec_u8())
    }

    fn mknod(
        &self,
        req: &RequestInfo,
        path: &Path,
        mode: u32,
        _umask: u32,
        _rdev: u32,
    ) -> Result<Entry, i32> {
        let real = self.real_path(path);
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&real)
            .map_err(|e| Self::io_errno(&e))?;
        fs::set_permissions(&real, fs::Permissions::from_mode(mode)).ok();
        let attr = self.getattr(req, path)?;
        Ok(Entry {
            attr: attr.attr,
            entry_ttl: TTL,
        })
    }

    fn mkdir(&self, req: &RequestInfo, path: &Path, mode: u32, _umask: u32) -> Result<Entry, i32> {
        let real = self.real_path(path);
        fs::create_dir(&real).map_err(|e| Self::io_errno(&e))?;
        fs::set_permissions(&real, fs::Permissions::from_mode(mode)).ok();
        let attr = self.getattr(req, path)?;
        Ok(Entry {
            attr: attr.attr,
            entry_ttl: TTL,
        })
    }

    fn unlink(&self, _req: &RequestInfo, path: &Path) -> Result<(), i32> {
        fs::remove_file(self.real_path(path)).map_err(|e| Self::io_errno(&e))
    }

    fn rmdir(&self, _req: &RequestInfo, path: &Path) -> Result<(), i32> {
        fs::remove_dir(self.real_path(path)).map_err(|e| Self::io_errno(&e))
    }

    fn symlink(&self, req: &RequestInfo, path: &Path, target: &Path) -> Result<Entry, i32> {
        std::os::unix::fs::symlink(target, self.real_path(path)).map_err(|e| Self::io_errno(&e))?;
        let attr = self.getattr(req, path)?;
        Ok(Entry {
            attr: attr.attr,
            entry_ttl: TTL,
        })
    }

    fn rename(&self, _req: &RequestInfo, from: &Path, to: &Path) -> Result<(), i32> {
        fs::rename(self.real_path(from), self.real_path(to)).map_err(|e| Self::io_errno(&e))
    }

    fn link(&self, req: &RequestInfo, path: &Path, new_path: &Path) -> Result<Entry, i32> {
        fs::hard_link(self.real_path(path), self.real_path(new_path)).map_err(|e| Self::io_errno(&e))?;
        let attr = self.getattr(req, new_path)?;
        Ok(Entry {
            attr: attr.attr,
            entry_ttl: TTL,
        })
    }

    fn open(&self, _req: &RequestInfo, path: &Path, flags: i32) -> Result<u64, i32> {
        let access = flags & libc::O_ACCMODE;
        let mut options = OpenOptions::new();
        match access {
            libc::O_RDONLY => {
                options.read(true);
            }
            libc::O_WRONLY => {
                options.write(true);
            }
            libc::O_RDWR => {
                options.read(true).write(true);
            }
            _ => {
                options.read(true);
            }
        }
        if flags & libc::O_APPEND != 0 {
            options.append(true);
        }
        let file = options.open(self.real_path(path)).map_err(|e| Self::io_errno(&e))?;
        Ok(self.take_fh(file))
    }

    fn read(
        &self,
        _req: &RequestInfo,
        _path: &Path,
        fh: u64,
        offset: i64,
        size: u32,
    ) -> Result<Vec<u8>, i32> {
        let handles = self.handles.lock().unwrap();
        let file = handles.get(&fh).ok_or(libc::EBADF)?;
        let mut buf = vec![0u8; size as usize];
        let read = file.read_at(&mut buf, offset as u64).map_err(|e| Self::io_errno(&e))?;
        buf.truncate(read);
        Ok(buf)
    }

    fn write(
        &self,
        _req: &RequestInfo,
        _path: &Path,
        fh: u64,
        offset: i64,
        data: &[u8],
    ) -> Result<u32, i32> {
        let handles = self.handles.lock().unwrap();
        let file = handles.get(&fh).ok_or(libc::EBADF)?;
        let written = file.write_at(data, offset as u64).map_err(|e| Self::io_errno(&e))?;
        Ok(written as u32)
    }

    fn flush(&self, _req: &RequestInfo, _path: &Path, fh: u64, _lock_owner: u64) -> Result<(), i32> {
        let handles = self.handles.lock().unwrap();
        let file = handles.get(&fh).ok_or(libc::EBADF)?;
        file.sync_data().map_err(|e| Self::io_errno(&e))
    }

    fn release(
        &self,
        _req: &RequestInfo,
        _path: &Path,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
    ) -> Result<(), i32> {
        self.handles.lock().unwrap().remove(&fh);
        Ok(())
    }

    fn fsync(&self, _req: &RequestInfo, _path: &Path, fh: u64, datasync: bool) -> Result<(), i32> {
        let handles = self.handles.lock().unwrap();
        let file = handles.get(&fh).ok_or(libc::EBADF)?;
        if datasync {
            file.sync_data().map_err(|e| Self::io_errno(&e))
        } else {
            file.sync_all().map_err(|e| Self::io_errno(&e))
        }
    }

    fn opendir(&self, _req: &RequestInfo, _path: &Path, _flags: i32) -> Result<u64, i32> {
        Ok(0)
    }

    fn readdir(
        &self,
        _req: &RequestInfo,
        path: &Path,
        _fh: u64,
        _offset: i64,
        sink: &mut DirEntrySink<'_>,
    ) -> Result<(), i32> {
        let real = self.real_path(path);
        sink(DirEntry {
            ino: 0,
            kind: FileType::Directory,
            name: OsString::from("."),
        });
        sink(DirEntry {
            ino: 0,
            kind: FileType::Directory,
            name: OsString::from(".."),
        });
        for dir_entry in fs::read_dir(&real).map_err(|e| Self::io_errno(&e))? {
            let dir_entry = dir_entry.map_err(|e| Self::io_errno(&e))?;
            let kind = dir_entry
                .file_type()
                .map(|t| {
                    if t.is_dir() {
                        FileType::Directory
                    } else if t.is_symlink() {
                        FileType::Symlink
                    } else {
                        FileType::RegularFile
                    }
                })
                .unwrap_or(FileType::RegularFile);
            sink(DirEntry {
                ino: 0,
                kind,
                name: dir_entry.file_name(),
            });
        }
        Ok(())
    }

    fn releasedir(&self, _req: &RequestInfo, _path: &Path, _fh: u64, _flags: i32) -> Result<(), i32> {
        Ok(())
    }

    fn statfs(&self, _req: &RequestInfo, path: &Path) -> Result<Statfs, i32> {
        let real = self.real_path(path);
        let c_path = std::ffi::CString::new(real.as_os_str().as_bytes()).map_err(|_| libc::EINVAL)?;
        let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stats) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
        }
        Ok(Statfs {
            blocks: stats.f_blocks as u64,
            bfree: stats.f_bfree as u64,
            bavail: stats.f_bavail as u64,
            files: stats.f_files as u64,
            ffree: stats.f_ffree as u64,
            bsize: stats.f_bsize as u32,
            namelen: stats.f_namemax as u32,
            frsize: stats.f_frsize as u32,
        })
    }
}

/// Small helper trait kept local to this binary: turns a symlink target
/// `OsString` into the raw bytes `PathnameFilesystem::readlink` returns.
trait IntoVecU8 {
    fn into_vec_u8(self) -> Vec<u8>;
}

impl IntoVecU8 for OsString {
    fn into_vec_u8(self) -> Vec<u8> {
        self.as_os_str().as_bytes().to_vec()
    }
}

fn main() {
    env_logger::init();

    let matches = Command::new("passthrough")
        .version("0.1.0")
        .author("H. Malthaner")
        .arg(
            Arg::new("MIRROR_DIR")
                .required(true)
                .index(1)
                .help("Real directory to mirror through FUSE"),
        )
        .arg(
            Arg::new("MOUNT_POINT")
                .required(true)
                .index(2)
                .help("Where to mount the mirrored filesystem"),
        )
        .arg(
            Arg::new("auto_unmount")
                .long("auto_unmount")
                .action(ArgAction::SetTrue)
                .help("Automatically unmount on process exit"),
        )
        .arg(
            Arg::new("allow-root")
                .long("allow-root")
                .action(ArgAction::SetTrue)
                .help("Allow root user to access filesystem"),
        )
        .arg(
            Arg::new("options")
                .long("options")
                .short('o')
                .help("Comma-separated fuse_path_core options (debug,hard_remove,use_ino,allow_root,readdir_ino)"),
        )
        .get_matches();

    let mirror = PathBuf::from(matches.get_one::<String>("MIRROR_DIR").unwrap());
    let mountpoint = matches.get_one::<String>("MOUNT_POINT").unwrap();

    let mut options = vec![MountOption::RW, MountOption::FSName("passthrough".to_string())];
    if matches.get_flag("auto_unmount") {
        options.push(MountOption::AutoUnmount);
    }
    if matches.get_flag("allow-root") {
        options.push(MountOption::AllowRoot);
    }

    let config_str = matches.get_one::<String>("options").map(String::as_str).unwrap_or("");
    let config = Config::parse(config_str);

    let fs = Passthrough::new(mirror);
    let exited = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    if let Err(err) = fuse_path_core::serve(fs, config, mountpoint, &options, exited) {
        log::error!("mount failed: {err}");
        std::process::exit(1);
    }
}
