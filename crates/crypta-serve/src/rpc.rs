//! ONC-RPC (RFC 5531) call parsing and reply framing.
//!
//! Record marking is handled by the connection layer; this module sees one
//! complete RPC message at a time. Credentials are parsed and discarded:
//! the server trusts its single loopback client and authenticates nothing
//! (volume access was authenticated by the passphrase at mount time).

use crate::xdr::{XdrError, XdrReader, XdrWriter};

pub const RPC_VERSION: u32 = 2;
pub const PROGRAM_NFS: u32 = 100_003;
pub const NFS_VERSION: u32 = 4;

pub const PROC_NULL: u32 = 0;
pub const PROC_COMPOUND: u32 = 1;

const MSG_CALL: u32 = 0;
const MSG_REPLY: u32 = 1;

const REPLY_ACCEPTED: u32 = 0;

/// accept_stat values.
pub const ACCEPT_SUCCESS: u32 = 0;
pub const ACCEPT_PROG_UNAVAIL: u32 = 1;
pub const ACCEPT_PROG_MISMATCH: u32 = 2;
pub const ACCEPT_PROC_UNAVAIL: u32 = 3;
pub const ACCEPT_GARBAGE_ARGS: u32 = 4;

const AUTH_NONE: u32 = 0;

/// Largest credential / verifier body we accept.
const MAX_AUTH_BODY: usize = 400;

/// A parsed call header; `args` is the procedure-specific remainder.
pub struct RpcCall<'a> {
    pub xid: u32,
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
    pub args: XdrReader<'a>,
}

/// Parses an RPC call message.
pub fn parse_call(message: &[u8]) -> Result<RpcCall<'_>, XdrError> {
    let mut r = XdrReader::new(message);
    let xid = r.u32()?;
    if r.u32()? != MSG_CALL {
        return Err(XdrError);
    }
    if r.u32()? != RPC_VERSION {
        return Err(XdrError);
    }
    let program = r.u32()?;
    let version = r.u32()?;
    let procedure = r.u32()?;

    // cred then verf: flavor + opaque body, both ignored.
    for _ in 0..2 {
        let _flavor = r.u32()?;
        r.opaque(MAX_AUTH_BODY)?;
    }

    Ok(RpcCall {
        xid,
        program,
        version,
        procedure,
        args: r,
    })
}

/// Builds an accepted reply carrying `body` (already-encoded results).
pub fn accepted_reply(xid: u32, accept_stat: u32, body: &[u8]) -> Vec<u8> {
    let mut w = XdrWriter::new();
    w.u32(xid)
        .u32(MSG_REPLY)
        .u32(REPLY_ACCEPTED)
        .u32(AUTH_NONE)
        .opaque(b"") // verifier body
        .u32(accept_stat)
        .raw(body);
    w.into_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_call(procedure: u32) -> Vec<u8> {
        let mut w = XdrWriter::new();
        w.u32(0xdead_beef)
            .u32(MSG_CALL)
            .u32(RPC_VERSION)
            .u32(PROGRAM_NFS)
            .u32(NFS_VERSION)
            .u32(procedure)
            .u32(AUTH_NONE)
            .opaque(b"")
            .u32(AUTH_NONE)
            .opaque(b"")
            .u32(42); // first arg word
        w.into_vec()
    }

    #[test]
    fn parses_a_call_and_leaves_args() {
        let bytes = sample_call(PROC_COMPOUND);
        let mut call = parse_call(&bytes).unwrap();
        assert_eq!(call.xid, 0xdead_beef);
        assert_eq!(call.program, PROGRAM_NFS);
        assert_eq!(call.version, NFS_VERSION);
        assert_eq!(call.procedure, PROC_COMPOUND);
        assert_eq!(call.args.u32().unwrap(), 42);
    }

    #[test]
    fn rejects_replies_and_bad_rpc_version() {
        let mut w = XdrWriter::new();
        w.u32(1).u32(MSG_REPLY);
        assert!(parse_call(&w.into_vec()).is_err());

        let mut w = XdrWriter::new();
        w.u32(1).u32(MSG_CALL).u32(3);
        assert!(parse_call(&w.into_vec()).is_err());
    }

    #[test]
    fn reply_echoes_xid() {
        let reply = accepted_reply(7, ACCEPT_SUCCESS, &[1, 2, 3, 4]);
        let mut r = XdrReader::new(&reply);
        assert_eq!(r.u32().unwrap(), 7);
        assert_eq!(r.u32().unwrap(), MSG_REPLY);
    }
}
