//! 9P protocol data types and constants.
//!
//! # Protocol
//! 9P2000 with the `.u` Unix extension.

use bitflags::bitflags;
use enum_primitive::*;

/// 9P2000 version string.
pub const P92000: &str = "9P2000";

/// 9P2000.u version string.
pub const P92000U: &str = "9P2000.u";

/// The version string `Rversion` carries when the server doesn't understand the
/// client's proposed version.
pub const VERSION_UNKNOWN: &str = "unknown";

/// Special tag which `Tversion`/`Rversion` must use as `tag`.
pub const NOTAG: u16 = !0;

/// Special value which `Tattach` with no auth must use as `afid`.
///
/// If the client does not wish to authenticate the connection, or knows that
/// authentication is not required, the afid field in the attach message should be set
/// to `NOFID`.
pub const NOFID: u32 = !0;

/// Special uid which `Tauth`/`Tattach` use as `n_uname` to indicate no uid is given.
pub const NONUNAME: u32 = !0;

/// Ample room for the non-payload portion of `Tread`/`Twrite`.
///
/// size\[4\] Tread/Twrite\[2\] tag\[2\] fid\[4\] offset\[8\] count\[4\]
pub const IOHDRSZ: u32 = 24;

/// Default announced `Msize` when none is configured.
pub const DEFAULT_MSIZE: u32 = 8192;

/// v9fs default port for the stock listener.
pub const V9FS_PORT: u16 = 5640;

/// Maximum number of names in a single `Twalk`.
pub const MAXWELEM: usize = 16;

/// Open mode (`Topen`/`Tcreate` mode byte).
pub mod om {
    /// Open for read.
    pub const READ: u8 = 0;
    /// Open for write.
    pub const WRITE: u8 = 1;
    /// Open for read and write.
    pub const RDWR: u8 = 2;
    /// Execute, == read but check execute permission.
    pub const EXEC: u8 = 3;
    /// Mask for the access-mode bits above.
    pub const MASK: u8 = 3;
    /// Or'ed in (except for exec): truncate file first.
    pub const TRUNC: u8 = 16;
    /// Or'ed in: close on exec.
    pub const CEXEC: u8 = 32;
    /// Or'ed in: remove on close.
    pub const RCLOSE: u8 = 64;
}

/// Bits in `Dir.mode`.
pub mod dm {
    pub const DIR: u32 = 0x8000_0000;
    pub const APPEND: u32 = 0x4000_0000;
    pub const EXCL: u32 = 0x2000_0000;
    pub const MOUNT: u32 = 0x1000_0000;
    pub const AUTH: u32 = 0x0800_0000;
    pub const TMP: u32 = 0x0400_0000;
    // 9P2000.u extensions.
    pub const SYMLINK: u32 = 0x0200_0000;
    pub const LINK: u32 = 0x0100_0000;
    pub const DEVICE: u32 = 0x0080_0000;
    pub const NAMEDPIPE: u32 = 0x0020_0000;
    pub const SOCKET: u32 = 0x0010_0000;
    pub const SETUID: u32 = 0x0008_0000;
    pub const SETGID: u32 = 0x0004_0000;
    pub const READ: u32 = 0x4;
    pub const WRITE: u32 = 0x2;
    pub const EXEC: u32 = 0x1;
}

bitflags! {
    /// Bits in `Qid.typ`.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct QidType: u8 {
        #[doc = "Type bit for directories"]
        const DIR     = 0x80;
        #[doc = "Type bit for append only files"]
        const APPEND  = 0x40;
        #[doc = "Type bit for exclusive use files"]
        const EXCL    = 0x20;
        #[doc = "Type bit for mounted channel"]
        const MOUNT   = 0x10;
        #[doc = "Type bit for authentication file"]
        const AUTH    = 0x08;
        #[doc = "Type bit for not-backed-up file"]
        const TMP     = 0x04;
        #[doc = "Type bit for symbolic links (9P2000.u)"]
        const SYMLINK = 0x02;
        #[doc = "Type bit for hard links (9P2000.u)"]
        const LINK    = 0x01;
        #[doc = "Plain file"]
        const FILE    = 0x00;
    }
}

impl From<std::fs::FileType> for QidType {
    fn from(typ: std::fs::FileType) -> Self {
        From::from(&typ)
    }
}

impl From<&std::fs::FileType> for QidType {
    fn from(typ: &std::fs::FileType) -> Self {
        use std::os::unix::fs::FileTypeExt;
        let mut qt = QidType::FILE;
        if typ.is_dir() {
            qt.insert(QidType::DIR);
        }
        if typ.is_symlink() {
            qt.insert(QidType::SYMLINK);
        }
        if typ.is_fifo() || typ.is_socket() {
            // named pipes and sockets have no 9P2000(.u) qid bit of their own;
            // callers distinguish them via Dir.mode's DMNAMEDPIPE/DMSOCKET instead.
        }
        qt
    }
}

/// Server-assigned identifier for a file across its lifetime.
///
/// # Protocol
/// 9P2000
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Qid {
    /// Whether the file is a directory, append-only file, etc.
    pub typ: QidType,
    /// Version number for a file; incremented on modification.
    pub version: u32,
    /// Integer unique among all files in the server's hierarchy.
    pub path: u64,
}

impl Qid {
    /// Size in bytes of the wire representation (1 + 4 + 8).
    pub const SIZE: usize = 13;
}

/// Directory entry / stat structure (`Tstat`/`Rstat`/`Twstat` payload).
///
/// # Protocol
/// 9P2000, with `.u` extending `ext`/`n_uid`/`n_gid`/`n_muid`.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Dir {
    /// Server type (kernel use; 0 for user-space servers).
    pub typ: u16,
    /// Server subtype.
    pub dev: u32,
    /// Qid of the file this entry describes.
    pub qid: Qid,
    /// Permissions and DM-flags.
    pub mode: u32,
    /// Last access time, seconds since epoch.
    pub atime: u32,
    /// Last modification time, seconds since epoch.
    pub mtime: u32,
    /// Length of the file in bytes.
    pub length: u64,
    /// Last element of the file's path.
    pub name: String,
    /// Owner name.
    pub uid: String,
    /// Group name.
    pub gid: String,
    /// Name of the user who last modified the file.
    pub muid: String,
    /// `.u`: symlink target, or empty for non-symlinks.
    pub ext: String,
    /// `.u`: numeric uid, or `NONUNAME` when not `.u`.
    pub n_uid: u32,
    /// `.u`: numeric gid, or `NONUNAME` when not `.u`.
    pub n_gid: u32,
    /// `.u`: numeric uid of the last modifier, or `NONUNAME` when not `.u`.
    pub n_muid: u32,
}

impl Dir {
    /// Size of the encoded stat, excluding the leading uint16 size prefix itself.
    pub fn size(&self, dotu: bool) -> u16 {
        let mut n = 2 // typ
            + 4 // dev
            + Qid::SIZE
            + 4 // mode
            + 4 // atime
            + 4 // mtime
            + 8 // length
            + 2 + self.name.len()
            + 2 + self.uid.len()
            + 2 + self.gid.len()
            + 2 + self.muid.len();
        if dotu {
            n += 2 + self.ext.len() + 4 + 4 + 4;
        }
        n as u16
    }
}

enum_from_primitive! {
    /// 9P message type code.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub enum MsgType {
        Tversion = 100,
        Rversion = 101,
        Tauth    = 102,
        Rauth    = 103,
        Tattach  = 104,
        Rattach  = 105,
        // 106/107 (Terror/Rerror-as-T) are illegal, never used as a T-message.
        Rerror   = 107,
        Tflush   = 108,
        Rflush   = 109,
        Twalk    = 110,
        Rwalk    = 111,
        Topen    = 112,
        Ropen    = 113,
        Tcreate  = 114,
        Rcreate  = 115,
        Tread    = 116,
        Rread    = 117,
        Twrite   = 118,
        Rwrite   = 119,
        Tclunk   = 120,
        Rclunk   = 121,
        Tremove  = 122,
        Rremove  = 123,
        Tstat    = 124,
        Rstat    = 125,
        Twstat   = 126,
        Rwstat   = 127,
    }
}

impl MsgType {
    /// Whether this is a client-to-server request type.
    pub fn is_t(self) -> bool {
        !self.is_r()
    }

    /// Whether this is a server-to-client response type.
    pub fn is_r(self) -> bool {
        use MsgType::*;
        matches!(
            self,
            Rversion | Rauth | Rattach | Rerror | Rflush | Rwalk | Ropen | Rcreate
                | Rread | Rwrite | Rclunk | Rremove | Rstat | Rwstat
        )
    }
}

impl From<&Fcall> for MsgType {
    fn from(body: &Fcall) -> MsgType {
        use Fcall::*;
        match *body {
            Tversion { .. } => MsgType::Tversion,
            Rversion { .. } => MsgType::Rversion,
            Tauth { .. } => MsgType::Tauth,
            Rauth { .. } => MsgType::Rauth,
            Tattach { .. } => MsgType::Tattach,
            Rattach { .. } => MsgType::Rattach,
            Rerror { .. } => MsgType::Rerror,
            Tflush { .. } => MsgType::Tflush,
            Rflush => MsgType::Rflush,
            Twalk { .. } => MsgType::Twalk,
            Rwalk { .. } => MsgType::Rwalk,
            Topen { .. } => MsgType::Topen,
            Ropen { .. } => MsgType::Ropen,
            Tcreate { .. } => MsgType::Tcreate,
            Rcreate { .. } => MsgType::Rcreate,
            Tread { .. } => MsgType::Tread,
            Rread { .. } => MsgType::Rread,
            Twrite { .. } => MsgType::Twrite,
            Rwrite { .. } => MsgType::Rwrite,
            Tclunk { .. } => MsgType::Tclunk,
            Rclunk => MsgType::Rclunk,
            Tremove { .. } => MsgType::Tremove,
            Rremove => MsgType::Rremove,
            Tstat { .. } => MsgType::Tstat,
            Rstat { .. } => MsgType::Rstat,
            Twstat { .. } => MsgType::Twstat,
            Rwstat => MsgType::Rwstat,
        }
    }
}

/// A data type encapsulating the various 9P messages.
///
/// # Protocol
/// 9P2000, `.u` where noted.
#[derive(Clone, Debug, PartialEq)]
pub enum Fcall {
    Tversion { msize: u32, version: String },
    Rversion { msize: u32, version: String },
    /// `.u`: `n_uname` carries the numeric uid when `uname` is empty.
    Tauth { afid: u32, uname: String, aname: String, n_uname: u32 },
    Rauth { aqid: Qid },
    /// `errnum` is only meaningful once `.u` negotiates; plain 9P2000 sends 0.
    Rerror { ename: String, errnum: u32 },
    Tattach { fid: u32, afid: u32, uname: String, aname: String, n_uname: u32 },
    Rattach { qid: Qid },
    Tflush { oldtag: u16 },
    Rflush,
    Twalk { fid: u32, newfid: u32, wnames: Vec<String> },
    Rwalk { wqids: Vec<Qid> },
    Topen { fid: u32, mode: u8 },
    Ropen { qid: Qid, iounit: u32 },
    /// `.u`: `extension` carries the symlink target / device spec for special files.
    Tcreate { fid: u32, name: String, perm: u32, mode: u8, extension: String },
    Rcreate { qid: Qid, iounit: u32 },
    Tread { fid: u32, offset: u64, count: u32 },
    Rread { data: Vec<u8> },
    Twrite { fid: u32, offset: u64, data: Vec<u8> },
    Rwrite { count: u32 },
    Tclunk { fid: u32 },
    Rclunk,
    Tremove { fid: u32 },
    Rremove,
    Tstat { fid: u32 },
    Rstat { stat: Dir },
    Twstat { fid: u32, stat: Dir },
    Rwstat,
}

impl Fcall {
    /// The fid(s) this message references, if any (used for bookkeeping, not wire
    /// format).
    pub fn fids(&self) -> Vec<u32> {
        use Fcall::*;
        match *self {
            Tattach { afid, .. } if afid != NOFID => vec![afid],
            Twalk { fid, .. } => vec![fid],
            Topen { fid, .. } => vec![fid],
            Tcreate { fid, .. } => vec![fid],
            Tread { fid, .. } => vec![fid],
            Twrite { fid, .. } => vec![fid],
            Tclunk { fid } => vec![fid],
            Tremove { fid } => vec![fid],
            Tstat { fid } => vec![fid],
            Twstat { fid, .. } => vec![fid],
            _ => Vec::new(),
        }
    }

    /// The fid this message allocates on a successful reply, if any.
    pub fn newfid(&self) -> Option<u32> {
        use Fcall::*;
        match *self {
            Tauth { afid, .. } => Some(afid),
            Tattach { fid, .. } => Some(fid),
            Twalk { newfid, .. } => Some(newfid),
            _ => None,
        }
    }
}

/// Envelope for a 9P message: the type-carrying body plus its tag.
#[derive(Clone, Debug, PartialEq)]
pub struct Msg {
    /// Chosen by the client to identify the message; the reply carries the same tag.
    pub tag: u16,
    /// The message body.
    pub body: Fcall,
}

impl Msg {
    pub fn typ(&self) -> MsgType {
        MsgType::from(&self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qid_type_from_dir_metadata() {
        let qt = QidType::DIR;
        assert!(qt.contains(QidType::DIR));
        assert!(!qt.contains(QidType::FILE) || qt == QidType::FILE);
    }

    #[test]
    fn dir_size_grows_with_dotu() {
        let d = Dir {
            name: "foo".into(),
            uid: "root".into(),
            gid: "root".into(),
            muid: "root".into(),
            ..Default::default()
        };
        assert!(d.size(true) > d.size(false));
    }

    #[test]
    fn msg_type_is_r_partitions_correctly() {
        assert!(MsgType::Rversion.is_r());
        assert!(MsgType::Tversion.is_t());
        assert!(!MsgType::Tread.is_r());
    }
}
