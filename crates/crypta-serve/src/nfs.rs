//! NFSv4 (RFC 7530) COMPOUND dispatcher over the exported three-handle
//! namespace.
//!
//! The export is deliberately tiny: a root directory, the `volume` file
//! whose contents are the decrypted block device, and an empty `control`
//! file. State handling is lax where the protocol allows a server to be:
//! every open gets the same stateid, locks always succeed, and leases never
//! expire, because the only client is the local kernel talking to its own
//! loopback.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::xdr::{XdrError, XdrReader, XdrWriter};
use crate::{BlockDevice, BlockError, device_read, device_write};

// Operation numbers (RFC 7530 §16).
const OP_ACCESS: u32 = 3;
const OP_CLOSE: u32 = 4;
const OP_COMMIT: u32 = 5;
const OP_GETATTR: u32 = 9;
const OP_GETFH: u32 = 10;
const OP_LOCK: u32 = 12;
const OP_LOCKT: u32 = 13;
const OP_LOCKU: u32 = 14;
const OP_LOOKUP: u32 = 15;
const OP_OPEN: u32 = 18;
const OP_OPEN_CONFIRM: u32 = 20;
const OP_PUTFH: u32 = 22;
const OP_PUTROOTFH: u32 = 24;
const OP_READ: u32 = 25;
const OP_READDIR: u32 = 26;
const OP_RENEW: u32 = 30;
const OP_RESTOREFH: u32 = 31;
const OP_SAVEFH: u32 = 32;
const OP_SECINFO: u32 = 33;
const OP_SETATTR: u32 = 34;
const OP_SETCLIENTID: u32 = 35;
const OP_SETCLIENTID_CONFIRM: u32 = 36;
const OP_VERIFY: u32 = 37;
const OP_WRITE: u32 = 38;
const OP_RELEASE_LOCKOWNER: u32 = 39;

// Status codes.
const NFS4_OK: u32 = 0;
const NFS4ERR_NOENT: u32 = 2;
const NFS4ERR_IO: u32 = 5;
const NFS4ERR_ACCESS: u32 = 13;
const NFS4ERR_NOTDIR: u32 = 20;
const NFS4ERR_INVAL: u32 = 22;
const NFS4ERR_ROFS: u32 = 30;
const NFS4ERR_STALE: u32 = 70;
const NFS4ERR_BADXDR: u32 = 10036;
const NFS4ERR_NOTSUPP: u32 = 10004;
const NFS4ERR_MINOR_VERS_MISMATCH: u32 = 10021;
const NFS4ERR_NOFILEHANDLE: u32 = 10020;
const NFS4ERR_RESTOREFH: u32 = 10030;
const NFS4ERR_NOT_SAME: u32 = 10027;
const NFS4ERR_ATTRNOTSUPP: u32 = 10032;

// ACCESS bits.
const ACCESS4_READ: u32 = 0x01;
const ACCESS4_LOOKUP: u32 = 0x02;
const ACCESS4_MODIFY: u32 = 0x04;
const ACCESS4_EXTEND: u32 = 0x08;

const FH4_PERSISTENT: u32 = 0;
const LEASE_SECONDS: u32 = 90;
const MAX_RW: usize = 262_144;

const WRITE_UNSTABLE: u32 = 0;
const WRITE_FILE_SYNC: u32 = 2;

const OPEN4_CREATE: u32 = 1;
const CREATE_EXCLUSIVE: u32 = 2;
const CLAIM_NULL: u32 = 0;
const OPEN_DELEGATE_NONE: u32 = 0;

/// The stateid handed to every open and lock.
const STATEID_OTHER: [u8; 12] = *b"crypta-vol-0";

/// The three exported filehandles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fh {
    Root,
    Volume,
    Control,
}

impl Fh {
    pub const VOLUME_NAME: &'static str = "volume";
    pub const CONTROL_NAME: &'static str = "control";

    fn bytes(&self) -> &'static [u8] {
        match self {
            Fh::Root => b"crypta:root\0",
            Fh::Volume => b"crypta:vol\0\0",
            Fh::Control => b"crypta:ctl\0\0",
        }
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        [Fh::Root, Fh::Volume, Fh::Control]
            .into_iter()
            .find(|fh| fh.bytes() == bytes)
    }

    fn fileid(&self) -> u64 {
        match self {
            Fh::Root => 1,
            Fh::Volume => 2,
            Fh::Control => 3,
        }
    }

    fn is_dir(&self) -> bool {
        matches!(self, Fh::Root)
    }
}

/// Per-connection protocol state.
#[derive(Default)]
pub struct Session {
    current: Option<Fh>,
    saved: Option<Fh>,
}

/// Shared server-side state for one exported volume.
pub struct NfsState {
    device: Arc<dyn BlockDevice>,
    /// Bumped on every write; backs the `change` attribute.
    change: AtomicU64,
    /// SETCLIENTID counter.
    next_clientid: AtomicU64,
    /// Mount time, used for the static timestamps and the write verifier.
    birth_secs: u64,
}

impl NfsState {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let birth_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            device,
            change: AtomicU64::new(1),
            next_clientid: AtomicU64::new(0x6372_0001),
            birth_secs,
        }
    }

    fn verifier(&self) -> [u8; 8] {
        self.birth_secs.to_be_bytes()
    }

    fn size_of(&self, fh: Fh) -> u64 {
        match fh {
            Fh::Root => 4096,
            Fh::Volume => self.device.volume_size(),
            Fh::Control => 0,
        }
    }
}

/// Handles one COMPOUND procedure; returns the encoded result body.
pub fn handle_compound(state: &NfsState, session: &mut Session, args: &mut XdrReader<'_>) -> Vec<u8> {
    let mut reply = XdrWriter::new();

    let parsed = (|| -> Result<(Vec<u8>, u32), XdrError> {
        let tag = args.opaque(1024)?.to_vec();
        let minor = args.u32()?;
        Ok((tag, minor))
    })();
    let (tag, minor) = match parsed {
        Ok(parts) => parts,
        Err(_) => {
            reply.u32(NFS4ERR_BADXDR).opaque(b"").u32(0);
            return reply.into_vec();
        }
    };

    if minor != 0 {
        reply.u32(NFS4ERR_MINOR_VERS_MISMATCH).opaque(&tag).u32(0);
        return reply.into_vec();
    }

    let numops = match args.u32() {
        Ok(n) => n,
        Err(_) => {
            reply.u32(NFS4ERR_BADXDR).opaque(&tag).u32(0);
            return reply.into_vec();
        }
    };

    let mut results = XdrWriter::new();
    let mut status = NFS4_OK;
    let mut completed = 0u32;

    for _ in 0..numops {
        let opcode = match args.u32() {
            Ok(op) => op,
            Err(_) => {
                status = NFS4ERR_BADXDR;
                break;
            }
        };
        results.u32(opcode);
        status = match dispatch(state, session, opcode, args, &mut results) {
            Ok(st) => st,
            Err(XdrError) => {
                results.u32(NFS4ERR_BADXDR);
                NFS4ERR_BADXDR
            }
        };
        completed += 1;
        if status != NFS4_OK {
            break;
        }
    }

    reply.u32(status).opaque(&tag).u32(completed);
    reply.raw(&results.into_vec());
    reply.into_vec()
}

/// Runs one operation, writing `status [body]` into `out` (after the opcode
/// already written by the caller). Returns the status.
fn dispatch(
    state: &NfsState,
    session: &mut Session,
    opcode: u32,
    args: &mut XdrReader<'_>,
    out: &mut XdrWriter,
) -> Result<u32, XdrError> {
    match opcode {
        OP_PUTROOTFH => {
            session.current = Some(Fh::Root);
            out.u32(NFS4_OK);
            Ok(NFS4_OK)
        }
        OP_PUTFH => {
            let raw = args.opaque(128)?;
            match Fh::from_bytes(raw) {
                Some(fh) => {
                    session.current = Some(fh);
                    out.u32(NFS4_OK);
                    Ok(NFS4_OK)
                }
                None => {
                    out.u32(NFS4ERR_STALE);
                    Ok(NFS4ERR_STALE)
                }
            }
        }
        OP_GETFH => match session.current {
            Some(fh) => {
                out.u32(NFS4_OK).opaque(fh.bytes());
                Ok(NFS4_OK)
            }
            None => {
                out.u32(NFS4ERR_NOFILEHANDLE);
                Ok(NFS4ERR_NOFILEHANDLE)
            }
        },
        OP_SAVEFH => match session.current {
            Some(fh) => {
                session.saved = Some(fh);
                out.u32(NFS4_OK);
                Ok(NFS4_OK)
            }
            None => {
                out.u32(NFS4ERR_NOFILEHANDLE);
                Ok(NFS4ERR_NOFILEHANDLE)
            }
        },
        OP_RESTOREFH => match session.saved {
            Some(fh) => {
                session.current = Some(fh);
                out.u32(NFS4_OK);
                Ok(NFS4_OK)
            }
            None => {
                out.u32(NFS4ERR_RESTOREFH);
                Ok(NFS4ERR_RESTOREFH)
            }
        },
        OP_LOOKUP => {
            let name = args.string(255)?.to_string();
            let Some(dir) = session.current else {
                out.u32(NFS4ERR_NOFILEHANDLE);
                return Ok(NFS4ERR_NOFILEHANDLE);
            };
            if !dir.is_dir() {
                out.u32(NFS4ERR_NOTDIR);
                return Ok(NFS4ERR_NOTDIR);
            }
            match lookup_name(&name) {
                Some(fh) => {
                    session.current = Some(fh);
                    out.u32(NFS4_OK);
                    Ok(NFS4_OK)
                }
                None => {
                    out.u32(NFS4ERR_NOENT);
                    Ok(NFS4ERR_NOENT)
                }
            }
        }
        OP_GETATTR => {
            let requested = args.bitmap()?;
            let Some(fh) = session.current else {
                out.u32(NFS4ERR_NOFILEHANDLE);
                return Ok(NFS4ERR_NOFILEHANDLE);
            };
            out.u32(NFS4_OK);
            encode_fattr(state, fh, &requested, out);
            Ok(NFS4_OK)
        }
        OP_ACCESS => {
            let wanted = args.u32()?;
            let Some(fh) = session.current else {
                out.u32(NFS4ERR_NOFILEHANDLE);
                return Ok(NFS4ERR_NOFILEHANDLE);
            };
            let supported = if fh.is_dir() {
                ACCESS4_READ | ACCESS4_LOOKUP
            } else {
                ACCESS4_READ | ACCESS4_MODIFY | ACCESS4_EXTEND
            };
            out.u32(NFS4_OK).u32(supported).u32(wanted & supported);
            Ok(NFS4_OK)
        }
        OP_READDIR => op_readdir(state, session, args, out),
        OP_OPEN => op_open(state, session, args, out),
        OP_OPEN_CONFIRM => {
            let _stateid = read_stateid(args)?;
            let seqid = args.u32()?;
            out.u32(NFS4_OK);
            write_stateid(out, seqid.wrapping_add(1));
            Ok(NFS4_OK)
        }
        OP_CLOSE => {
            let _seqid = args.u32()?;
            let _stateid = read_stateid(args)?;
            out.u32(NFS4_OK);
            write_stateid(out, 1);
            Ok(NFS4_OK)
        }
        OP_READ => op_read(state, session, args, out),
        OP_WRITE => op_write(state, session, args, out),
        OP_COMMIT => {
            let _offset = args.u64()?;
            let _count = args.u32()?;
            let status = match state.device.sync() {
                Ok(()) => NFS4_OK,
                Err(err) => block_status(err),
            };
            out.u32(status);
            if status == NFS4_OK {
                out.opaque_fixed(&state.verifier());
            }
            Ok(status)
        }
        OP_SETATTR => {
            let _stateid = read_stateid(args)?;
            skip_fattr(args)?;
            // Nothing in the export is settable; report no attributes set.
            out.u32(NFS4_OK).bitmap(&[]);
            Ok(NFS4_OK)
        }
        OP_VERIFY => op_verify(state, session, args, out),
        OP_SETCLIENTID => {
            let _verifier = args.opaque_fixed(8)?;
            let _id = args.opaque(1024)?;
            let _cb_program = args.u32()?;
            let _netid = args.string(128)?;
            let _addr = args.string(128)?;
            let _ident = args.u32()?;
            let clientid = state.next_clientid.fetch_add(1, Ordering::Relaxed);
            out.u32(NFS4_OK).u64(clientid).opaque_fixed(&state.verifier());
            Ok(NFS4_OK)
        }
        OP_SETCLIENTID_CONFIRM => {
            let _clientid = args.u64()?;
            let _verifier = args.opaque_fixed(8)?;
            out.u32(NFS4_OK);
            Ok(NFS4_OK)
        }
        OP_RENEW => {
            let _clientid = args.u64()?;
            out.u32(NFS4_OK);
            Ok(NFS4_OK)
        }
        OP_LOCK => op_lock(args, out),
        OP_LOCKT => {
            let _locktype = args.u32()?;
            let _offset = args.u64()?;
            let _length = args.u64()?;
            let _clientid = args.u64()?;
            let _owner = args.opaque(1024)?;
            // Never any conflicting lock.
            out.u32(NFS4_OK);
            Ok(NFS4_OK)
        }
        OP_LOCKU => {
            let _locktype = args.u32()?;
            let _seqid = args.u32()?;
            let _stateid = read_stateid(args)?;
            let _offset = args.u64()?;
            let _length = args.u64()?;
            out.u32(NFS4_OK);
            write_stateid(out, 1);
            Ok(NFS4_OK)
        }
        OP_RELEASE_LOCKOWNER => {
            let _clientid = args.u64()?;
            let _owner = args.opaque(1024)?;
            out.u32(NFS4_OK);
            Ok(NFS4_OK)
        }
        OP_SECINFO => {
            let _name = args.string(255)?;
            // AUTH_SYS then AUTH_NONE; access control happened at mount.
            out.u32(NFS4_OK).u32(2).u32(1).u32(0);
            Ok(NFS4_OK)
        }
        _ => {
            log::debug!("unsupported NFSv4 op {opcode}");
            out.u32(NFS4ERR_NOTSUPP);
            Ok(NFS4ERR_NOTSUPP)
        }
    }
}

fn lookup_name(name: &str) -> Option<Fh> {
    match name {
        Fh::VOLUME_NAME => Some(Fh::Volume),
        Fh::CONTROL_NAME => Some(Fh::Control),
        _ => None,
    }
}

fn read_stateid(args: &mut XdrReader<'_>) -> Result<u32, XdrError> {
    let seqid = args.u32()?;
    let _other = args.opaque_fixed(12)?;
    Ok(seqid)
}

fn write_stateid(out: &mut XdrWriter, seqid: u32) {
    out.u32(seqid).opaque_fixed(&STATEID_OTHER);
}

fn block_status(err: BlockError) -> u32 {
    match err {
        BlockError::Stale => NFS4ERR_STALE,
        BlockError::Io => NFS4ERR_IO,
        BlockError::ReadOnly => NFS4ERR_ROFS,
        BlockError::Access => NFS4ERR_ACCESS,
        BlockError::Range => NFS4ERR_INVAL,
    }
}

fn op_open(
    state: &NfsState,
    session: &mut Session,
    args: &mut XdrReader<'_>,
    out: &mut XdrWriter,
) -> Result<u32, XdrError> {
    let _seqid = args.u32()?;
    let _share_access = args.u32()?;
    let _share_deny = args.u32()?;
    let _owner_clientid = args.u64()?;
    let _owner = args.opaque(1024)?;

    let opentype = args.u32()?;
    if opentype == OPEN4_CREATE {
        let how = args.u32()?;
        if how == CREATE_EXCLUSIVE {
            let _verifier = args.opaque_fixed(8)?;
        } else {
            skip_fattr(args)?;
        }
    }

    let claim = args.u32()?;
    if claim != CLAIM_NULL {
        out.u32(NFS4ERR_NOTSUPP);
        return Ok(NFS4ERR_NOTSUPP);
    }
    let name = args.string(255)?.to_string();

    let Some(dir) = session.current else {
        out.u32(NFS4ERR_NOFILEHANDLE);
        return Ok(NFS4ERR_NOFILEHANDLE);
    };
    if !dir.is_dir() {
        out.u32(NFS4ERR_NOTDIR);
        return Ok(NFS4ERR_NOTDIR);
    }
    let Some(fh) = lookup_name(&name) else {
        // The namespace is fixed; nothing can be created.
        out.u32(NFS4ERR_NOENT);
        return Ok(NFS4ERR_NOENT);
    };
    session.current = Some(fh);

    let change = state.change.load(Ordering::Relaxed);
    out.u32(NFS4_OK);
    write_stateid(out, 1);
    out.bool(true).u64(change).u64(change); // change_info4, atomic
    out.u32(0); // rflags: no confirmation required
    out.bitmap(&[]); // attrset
    out.u32(OPEN_DELEGATE_NONE);
    Ok(NFS4_OK)
}

fn op_read(
    state: &NfsState,
    session: &mut Session,
    args: &mut XdrReader<'_>,
    out: &mut XdrWriter,
) -> Result<u32, XdrError> {
    let _stateid = read_stateid(args)?;
    let offset = args.u64()?;
    let count = args.u32()? as usize;

    let Some(fh) = session.current else {
        out.u32(NFS4ERR_NOFILEHANDLE);
        return Ok(NFS4ERR_NOFILEHANDLE);
    };
    if fh.is_dir() {
        out.u32(NFS4ERR_INVAL);
        return Ok(NFS4ERR_INVAL);
    }
    if fh == Fh::Control {
        out.u32(NFS4_OK).bool(true).opaque(b"");
        return Ok(NFS4_OK);
    }

    match device_read(&state.device, offset, count.min(MAX_RW)) {
        Ok(data) => {
            let eof = offset + data.len() as u64 >= state.device.volume_size();
            out.u32(NFS4_OK).bool(eof).opaque(&data);
            Ok(NFS4_OK)
        }
        Err(err) => {
            let status = block_status(err);
            out.u32(status);
            Ok(status)
        }
    }
}

fn op_write(
    state: &NfsState,
    session: &mut Session,
    args: &mut XdrReader<'_>,
    out: &mut XdrWriter,
) -> Result<u32, XdrError> {
    let _stateid = read_stateid(args)?;
    let offset = args.u64()?;
    let stable = args.u32()?;
    let data = args.opaque(MAX_RW)?;

    let Some(fh) = session.current else {
        out.u32(NFS4ERR_NOFILEHANDLE);
        return Ok(NFS4ERR_NOFILEHANDLE);
    };
    if fh.is_dir() {
        out.u32(NFS4ERR_INVAL);
        return Ok(NFS4ERR_INVAL);
    }
    if fh == Fh::Control {
        // Writes to the control file are accepted and discarded.
        out.u32(NFS4_OK).u32(data.len() as u32).u32(WRITE_FILE_SYNC);
        out.opaque_fixed(&state.verifier());
        return Ok(NFS4_OK);
    }

    let result = device_write(&state.device, offset, data).and_then(|written| {
        if stable != WRITE_UNSTABLE {
            state.device.sync()?;
        }
        Ok(written)
    });
    match result {
        Ok(written) => {
            state.change.fetch_add(1, Ordering::Relaxed);
            let committed = if stable == WRITE_UNSTABLE { WRITE_UNSTABLE } else { WRITE_FILE_SYNC };
            out.u32(NFS4_OK).u32(written as u32).u32(committed);
            out.opaque_fixed(&state.verifier());
            Ok(NFS4_OK)
        }
        Err(err) => {
            let status = block_status(err);
            out.u32(status);
            Ok(status)
        }
    }
}

fn op_readdir(
    state: &NfsState,
    session: &mut Session,
    args: &mut XdrReader<'_>,
    out: &mut XdrWriter,
) -> Result<u32, XdrError> {
    let cookie = args.u64()?;
    let _cookieverf = args.opaque_fixed(8)?;
    let _dircount = args.u32()?;
    let _maxcount = args.u32()?;
    let requested = args.bitmap()?;

    let Some(dir) = session.current else {
        out.u32(NFS4ERR_NOFILEHANDLE);
        return Ok(NFS4ERR_NOFILEHANDLE);
    };
    if !dir.is_dir() {
        out.u32(NFS4ERR_NOTDIR);
        return Ok(NFS4ERR_NOTDIR);
    }

    out.u32(NFS4_OK);
    out.opaque_fixed(&[0u8; 8]); // cookieverf

    // Entry cookies start at 3 (0..2 are reserved by the protocol).
    let entries: [(u64, &str, Fh); 2] = [
        (3, Fh::VOLUME_NAME, Fh::Volume),
        (4, Fh::CONTROL_NAME, Fh::Control),
    ];
    for (entry_cookie, name, fh) in entries {
        if entry_cookie <= cookie {
            continue;
        }
        out.bool(true);
        out.u64(entry_cookie);
        out.string(name);
        encode_fattr(state, fh, &requested, out);
    }
    out.bool(false); // no more entries
    out.bool(true); // eof
    Ok(NFS4_OK)
}

fn op_lock(args: &mut XdrReader<'_>, out: &mut XdrWriter) -> Result<u32, XdrError> {
    let _locktype = args.u32()?;
    let _reclaim = args.bool()?;
    let _offset = args.u64()?;
    let _length = args.u64()?;
    let new_owner = args.bool()?;
    if new_owner {
        let _open_seqid = args.u32()?;
        let _open_stateid = read_stateid(args)?;
        let _lock_seqid = args.u32()?;
        let _clientid = args.u64()?;
        let _owner = args.opaque(1024)?;
    } else {
        let _lock_stateid = read_stateid(args)?;
        let _lock_seqid = args.u32()?;
    }
    // Single client: every lock is granted.
    out.u32(NFS4_OK);
    write_stateid(out, 1);
    Ok(NFS4_OK)
}

fn op_verify(
    state: &NfsState,
    session: &mut Session,
    args: &mut XdrReader<'_>,
    out: &mut XdrWriter,
) -> Result<u32, XdrError> {
    let requested = args.bitmap()?;
    let supplied = args.opaque(64 * 1024)?;

    let Some(fh) = session.current else {
        out.u32(NFS4ERR_NOFILEHANDLE);
        return Ok(NFS4ERR_NOFILEHANDLE);
    };
    for (word, mask) in requested.iter().enumerate() {
        if mask & !supported_word(word) != 0 {
            out.u32(NFS4ERR_ATTRNOTSUPP);
            return Ok(NFS4ERR_ATTRNOTSUPP);
        }
    }

    let mut ours = XdrWriter::new();
    encode_attr_values(state, fh, &requested, &mut ours);
    let status = if ours.into_vec() == supplied {
        NFS4_OK
    } else {
        NFS4ERR_NOT_SAME
    };
    out.u32(status);
    Ok(status)
}

// Attribute ids (RFC 7530 §5).
const ATTR_SUPPORTED: usize = 0;
const ATTR_TYPE: usize = 1;
const ATTR_FH_EXPIRE_TYPE: usize = 2;
const ATTR_CHANGE: usize = 3;
const ATTR_SIZE: usize = 4;
const ATTR_LINK_SUPPORT: usize = 5;
const ATTR_SYMLINK_SUPPORT: usize = 6;
const ATTR_NAMED_ATTR: usize = 7;
const ATTR_FSID: usize = 8;
const ATTR_UNIQUE_HANDLES: usize = 9;
const ATTR_LEASE_TIME: usize = 10;
const ATTR_RDATTR_ERROR: usize = 11;
const ATTR_FILEHANDLE: usize = 19;
const ATTR_FILEID: usize = 20;
const ATTR_FILES_AVAIL: usize = 21;
const ATTR_FILES_FREE: usize = 22;
const ATTR_FILES_TOTAL: usize = 23;
const ATTR_MAXFILESIZE: usize = 27;
const ATTR_MAXNAME: usize = 29;
const ATTR_MAXREAD: usize = 30;
const ATTR_MAXWRITE: usize = 31;
const ATTR_MODE: usize = 33;
const ATTR_NO_TRUNC: usize = 34;
const ATTR_NUMLINKS: usize = 35;
const ATTR_OWNER: usize = 36;
const ATTR_OWNER_GROUP: usize = 37;
const ATTR_SPACE_AVAIL: usize = 42;
const ATTR_SPACE_FREE: usize = 43;
const ATTR_SPACE_TOTAL: usize = 44;
const ATTR_SPACE_USED: usize = 45;
const ATTR_TIME_ACCESS: usize = 47;
const ATTR_TIME_METADATA: usize = 52;
const ATTR_TIME_MODIFY: usize = 53;
const ATTR_MOUNTED_ON_FILEID: usize = 55;

const SUPPORTED_ATTRS: [usize; 33] = [
    ATTR_SUPPORTED,
    ATTR_TYPE,
    ATTR_FH_EXPIRE_TYPE,
    ATTR_CHANGE,
    ATTR_SIZE,
    ATTR_LINK_SUPPORT,
    ATTR_SYMLINK_SUPPORT,
    ATTR_NAMED_ATTR,
    ATTR_FSID,
    ATTR_UNIQUE_HANDLES,
    ATTR_LEASE_TIME,
    ATTR_RDATTR_ERROR,
    ATTR_FILEHANDLE,
    ATTR_FILEID,
    ATTR_FILES_AVAIL,
    ATTR_FILES_FREE,
    ATTR_FILES_TOTAL,
    ATTR_MAXFILESIZE,
    ATTR_MAXNAME,
    ATTR_MAXREAD,
    ATTR_MAXWRITE,
    ATTR_MODE,
    ATTR_NO_TRUNC,
    ATTR_NUMLINKS,
    ATTR_OWNER,
    ATTR_OWNER_GROUP,
    ATTR_SPACE_AVAIL,
    ATTR_SPACE_FREE,
    ATTR_SPACE_TOTAL,
    ATTR_SPACE_USED,
    ATTR_TIME_ACCESS,
    ATTR_TIME_METADATA,
    ATTR_TIME_MODIFY,
];

fn supported_mask() -> [u32; 2] {
    let mut words = [0u32; 2];
    for attr in SUPPORTED_ATTRS {
        words[attr / 32] |= 1 << (attr % 32);
    }
    words[ATTR_MOUNTED_ON_FILEID / 32] |= 1 << (ATTR_MOUNTED_ON_FILEID % 32);
    words
}

fn supported_word(word: usize) -> u32 {
    *supported_mask().get(word).unwrap_or(&0)
}

/// Encodes a full fattr4: reply bitmap plus counted attribute list.
fn encode_fattr(state: &NfsState, fh: Fh, requested: &[u32], out: &mut XdrWriter) {
    let granted: Vec<u32> = requested
        .iter()
        .enumerate()
        .map(|(word, mask)| mask & supported_word(word))
        .collect();

    let mut values = XdrWriter::new();
    encode_attr_values(state, fh, &granted, &mut values);

    out.bitmap(&granted);
    out.opaque(&values.into_vec());
}

/// Encodes the attribute values for every granted bit, ascending.
fn encode_attr_values(state: &NfsState, fh: Fh, granted: &[u32], out: &mut XdrWriter) {
    let time = |out: &mut XdrWriter| {
        out.u64(state.birth_secs).u32(0);
    };

    for attr in 0..granted.len() * 32 {
        if granted[attr / 32] & (1 << (attr % 32)) == 0 {
            continue;
        }
        match attr {
            ATTR_SUPPORTED => {
                out.bitmap(&supported_mask());
            }
            ATTR_TYPE => {
                out.u32(if fh.is_dir() { 2 } else { 1 }); // NF4DIR / NF4REG
            }
            ATTR_FH_EXPIRE_TYPE => {
                out.u32(FH4_PERSISTENT);
            }
            ATTR_CHANGE => {
                out.u64(state.change.load(Ordering::Relaxed));
            }
            ATTR_SIZE => {
                out.u64(state.size_of(fh));
            }
            ATTR_LINK_SUPPORT | ATTR_SYMLINK_SUPPORT | ATTR_NAMED_ATTR => {
                out.bool(false);
            }
            ATTR_FSID => {
                out.u64(0x6372_7970).u64(0x7461);
            }
            ATTR_UNIQUE_HANDLES | ATTR_NO_TRUNC => {
                out.bool(true);
            }
            ATTR_LEASE_TIME => {
                out.u32(LEASE_SECONDS);
            }
            ATTR_RDATTR_ERROR => {
                out.u32(NFS4_OK);
            }
            ATTR_FILEHANDLE => {
                out.opaque(fh.bytes());
            }
            ATTR_FILEID => {
                out.u64(fh.fileid());
            }
            ATTR_FILES_AVAIL | ATTR_FILES_FREE => {
                out.u64(0);
            }
            ATTR_FILES_TOTAL => {
                out.u64(3);
            }
            ATTR_MAXFILESIZE => {
                out.u64(state.device.volume_size());
            }
            ATTR_MAXNAME => {
                out.u32(255);
            }
            ATTR_MAXREAD | ATTR_MAXWRITE => {
                out.u64(MAX_RW as u64);
            }
            ATTR_MODE => {
                out.u32(if fh.is_dir() { 0o755 } else { 0o600 });
            }
            ATTR_NUMLINKS => {
                out.u32(if fh.is_dir() { 2 } else { 1 });
            }
            ATTR_OWNER | ATTR_OWNER_GROUP => {
                out.string("0");
            }
            ATTR_SPACE_AVAIL | ATTR_SPACE_FREE => {
                out.u64(0);
            }
            ATTR_SPACE_TOTAL | ATTR_SPACE_USED => {
                out.u64(state.size_of(fh));
            }
            ATTR_TIME_ACCESS | ATTR_TIME_METADATA | ATTR_TIME_MODIFY => {
                time(out);
            }
            ATTR_MOUNTED_ON_FILEID => {
                out.u64(fh.fileid());
            }
            _ => {}
        }
    }
}

/// Skips a fattr4 (bitmap plus opaque attribute list).
fn skip_fattr(args: &mut XdrReader<'_>) -> Result<(), XdrError> {
    let _bitmap = args.bitmap()?;
    let _attrs = args.opaque(64 * 1024)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemDevice;

    fn state() -> NfsState {
        NfsState::new(MemDevice::new(1 << 20))
    }

    fn run(state: &NfsState, session: &mut Session, body: XdrWriter) -> Vec<u8> {
        let bytes = body.into_vec();
        let mut reader = XdrReader::new(&bytes);
        handle_compound(state, session, &mut reader)
    }

    fn compound(numops: u32) -> XdrWriter {
        let mut w = XdrWriter::new();
        w.opaque(b"t").u32(0).u32(numops);
        w
    }

    #[test]
    fn putrootfh_lookup_getfh() {
        let state = state();
        let mut session = Session::default();
        let mut body = compound(3);
        body.u32(OP_PUTROOTFH);
        body.u32(OP_LOOKUP).string(Fh::VOLUME_NAME);
        body.u32(OP_GETFH);
        let reply = run(&state, &mut session, body);

        let mut r = XdrReader::new(&reply);
        assert_eq!(r.u32().unwrap(), NFS4_OK); // overall status
        r.opaque(1024).unwrap(); // tag
        assert_eq!(r.u32().unwrap(), 3); // three results
        assert_eq!(r.u32().unwrap(), OP_PUTROOTFH);
        assert_eq!(r.u32().unwrap(), NFS4_OK);
        assert_eq!(r.u32().unwrap(), OP_LOOKUP);
        assert_eq!(r.u32().unwrap(), NFS4_OK);
        assert_eq!(r.u32().unwrap(), OP_GETFH);
        assert_eq!(r.u32().unwrap(), NFS4_OK);
        assert_eq!(r.opaque(128).unwrap(), Fh::Volume.bytes());
    }

    #[test]
    fn lookup_unknown_name_stops_the_compound() {
        let state = state();
        let mut session = Session::default();
        let mut body = compound(3);
        body.u32(OP_PUTROOTFH);
        body.u32(OP_LOOKUP).string("missing");
        body.u32(OP_GETFH);
        let reply = run(&state, &mut session, body);

        let mut r = XdrReader::new(&reply);
        assert_eq!(r.u32().unwrap(), NFS4ERR_NOENT);
        r.opaque(1024).unwrap();
        assert_eq!(r.u32().unwrap(), 2, "processing stops at the failed op");
    }

    #[test]
    fn write_then_read_round_trips_through_the_device() {
        let state = state();
        let mut session = Session::default();

        let mut body = compound(3);
        body.u32(OP_PUTROOTFH);
        body.u32(OP_LOOKUP).string(Fh::VOLUME_NAME);
        body.u32(OP_WRITE);
        write_stateid_args(&mut body);
        body.u64(8192).u32(WRITE_FILE_SYNC).opaque(b"persisted payload");
        let reply = run(&state, &mut session, body);
        let mut r = XdrReader::new(&reply);
        assert_eq!(r.u32().unwrap(), NFS4_OK);

        let mut body = compound(3);
        body.u32(OP_PUTROOTFH);
        body.u32(OP_LOOKUP).string(Fh::VOLUME_NAME);
        body.u32(OP_READ);
        write_stateid_args(&mut body);
        body.u64(8192).u32(17);
        let reply = run(&state, &mut session, body);

        let mut r = XdrReader::new(&reply);
        assert_eq!(r.u32().unwrap(), NFS4_OK);
        r.opaque(1024).unwrap();
        assert_eq!(r.u32().unwrap(), 3);
        // Skip PUTROOTFH and LOOKUP results.
        assert_eq!(r.u32().unwrap(), OP_PUTROOTFH);
        assert_eq!(r.u32().unwrap(), NFS4_OK);
        assert_eq!(r.u32().unwrap(), OP_LOOKUP);
        assert_eq!(r.u32().unwrap(), NFS4_OK);
        assert_eq!(r.u32().unwrap(), OP_READ);
        assert_eq!(r.u32().unwrap(), NFS4_OK);
        let _eof = r.bool().unwrap();
        assert_eq!(r.opaque(1024).unwrap(), b"persisted payload");
    }

    #[test]
    fn getattr_returns_requested_size() {
        let state = state();
        let mut session = Session::default();
        let mut body = compound(3);
        body.u32(OP_PUTROOTFH);
        body.u32(OP_LOOKUP).string(Fh::VOLUME_NAME);
        body.u32(OP_GETATTR).bitmap(&[1 << ATTR_SIZE]);
        let reply = run(&state, &mut session, body);

        let mut r = XdrReader::new(&reply);
        assert_eq!(r.u32().unwrap(), NFS4_OK);
        r.opaque(1024).unwrap();
        assert_eq!(r.u32().unwrap(), 3);
        for _ in 0..2 {
            r.u32().unwrap();
            r.u32().unwrap();
        }
        assert_eq!(r.u32().unwrap(), OP_GETATTR);
        assert_eq!(r.u32().unwrap(), NFS4_OK);
        assert_eq!(r.bitmap().unwrap(), vec![1 << ATTR_SIZE]);
        let values = r.opaque(64).unwrap();
        assert_eq!(values, &(1u64 << 20).to_be_bytes()[..]);
    }

    #[test]
    fn unsupported_op_reports_notsupp() {
        let state = state();
        let mut session = Session::default();
        let mut body = compound(1);
        body.u32(6); // CREATE, deliberately unsupported
        let reply = run(&state, &mut session, body);
        let mut r = XdrReader::new(&reply);
        assert_eq!(r.u32().unwrap(), NFS4ERR_NOTSUPP);
    }

    #[test]
    fn minor_version_mismatch() {
        let state = state();
        let mut session = Session::default();
        let mut w = XdrWriter::new();
        w.opaque(b"").u32(1).u32(0);
        let bytes = w.into_vec();
        let mut reader = XdrReader::new(&bytes);
        let reply = handle_compound(&state, &mut session, &mut reader);
        let mut r = XdrReader::new(&reply);
        assert_eq!(r.u32().unwrap(), NFS4ERR_MINOR_VERS_MISMATCH);
    }

    fn write_stateid_args(body: &mut XdrWriter) {
        body.u32(1).opaque_fixed(&STATEID_OTHER);
    }
}
