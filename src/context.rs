//! Per-request user-identity context handed to pathname callbacks.

/// Identity and bookkeeping fields lifted off a `fuser::Request` before the
/// dispatcher forgets about node ids and starts talking in paths.
#[derive(Debug, Clone, Copy)]
pub struct RequestInfo {
    /// The unique id FUSE assigned this request; used to correlate a
    /// compensating forget/release with the request that needed it.
    pub unique: u64,
    /// The user id of the process making the request.
    pub uid: u32,
    /// The group id of the process making the request.
    pub gid: u32,
    /// The process id of the process making the request.
    pub pid: u32,
}

impl RequestInfo {
    pub(crate) fn from_request(req: &fuser::Request<'_>) -> RequestInfo {
        RequestInfo {
            unique: req.unique(),
            uid: req.uid(),
            gid: req.gid(),
            pid: req.pid(),
        }
    }
}
