//! Dismount-while-serving: the server must stop promptly, the mock client
//! must see completion or a closed connection, and the volume must come
//! down cleanly afterwards.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, TcpStream};
use std::path::Path;
use std::time::{Duration, Instant};

use crypta::serve::xdr::{XdrReader, XdrWriter};
use crypta::serve::{NfsServer, ServerRunner};
use crypta::volume::create::CreateProgress;
use crypta::volume::{CreateOptions, Credentials, MountOptions, create_volume, open_volume};
use crypta::{CancelToken, KdfId};

// Protocol constants, fixed by RFC 7530.
const OP_PUTROOTFH: u32 = 24;
const OP_LOOKUP: u32 = 15;
const OP_READ: u32 = 25;
const NFS4_OK: u32 = 0;
const RECORD_LAST: u32 = 0x8000_0000;

const KDF: KdfId = KdfId::Pbkdf2Sha512 { strengthened: false };

fn mounted_volume(dir: &tempfile::TempDir) -> crypta::MountedVolume {
    let path = dir.path().join("vault.tc");
    let creds = Credentials::new(&b"serving"[..]);
    create_volume(
        &path,
        &creds,
        &CreateOptions {
            size: 4 << 20,
            kdf: KDF,
            quick_format: true,
            ..Default::default()
        },
        &CreateProgress::new(),
        &CancelToken::new(),
    )
    .unwrap();
    open_volume(
        Path::new(&path),
        &creds,
        &MountOptions {
            kdf: Some(KDF),
            ..Default::default()
        },
        &CancelToken::new(),
    )
    .unwrap()
}

fn rpc_compound(xid: u32, body: impl FnOnce(&mut XdrWriter) -> u32) -> Vec<u8> {
    let mut ops = XdrWriter::new();
    let numops = body(&mut ops);

    let mut w = XdrWriter::new();
    w.u32(xid)
        .u32(0) // CALL
        .u32(2) // RPC v2
        .u32(100_003)
        .u32(4)
        .u32(1) // COMPOUND
        .u32(0)
        .opaque(b"") // cred
        .u32(0)
        .opaque(b"") // verf
        .opaque(b"") // tag
        .u32(0) // minorversion
        .u32(numops)
        .raw(&ops.into_vec());
    w.into_vec()
}

fn read_call(xid: u32, offset: u64, count: u32) -> Vec<u8> {
    rpc_compound(xid, |ops| {
        ops.u32(OP_PUTROOTFH);
        ops.u32(OP_LOOKUP).string("volume");
        ops.u32(OP_READ);
        ops.u32(1).opaque_fixed(b"crypta-vol-0"); // any stateid is accepted
        ops.u64(offset).u32(count);
        3
    })
}

fn exchange(stream: &mut TcpStream, message: &[u8]) -> std::io::Result<Vec<u8>> {
    stream.write_all(&(RECORD_LAST | message.len() as u32).to_be_bytes())?;
    stream.write_all(message)?;
    let mut head = [0u8; 4];
    stream.read_exact(&mut head)?;
    let len = (u32::from_be_bytes(head) & !RECORD_LAST) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    Ok(body)
}

/// Skips the RPC reply header and the PUTROOTFH/LOOKUP results, leaving the
/// reader at the READ result. Returns the READ status.
fn seek_read_result<'a>(reply: &'a [u8]) -> (u32, XdrReader<'a>) {
    let mut r = XdrReader::new(reply);
    r.u32().unwrap(); // xid
    r.u32().unwrap(); // REPLY
    r.u32().unwrap(); // accepted
    r.u32().unwrap(); // verf flavor
    r.opaque(64).unwrap(); // verf body
    r.u32().unwrap(); // accept_stat
    r.u32().unwrap(); // compound status
    r.opaque(64).unwrap(); // tag
    let numres = r.u32().unwrap();
    assert_eq!(numres, 3);
    for _ in 0..2 {
        r.u32().unwrap(); // opcode
        assert_eq!(r.u32().unwrap(), NFS4_OK);
    }
    assert_eq!(r.u32().unwrap(), OP_READ);
    let status = r.u32().unwrap();
    (status, r)
}

#[test]
fn reads_flow_through_the_served_volume() {
    let dir = tempfile::tempdir().unwrap();
    let volume = mounted_volume(&dir);
    volume.translator().write_sectors(0, &[0x5Au8; 4096]).unwrap();

    let server = NfsServer::bind(volume.translator()).unwrap();
    let port = server.local_port();
    let runner = ServerRunner::spawn(server);

    let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
    let reply = exchange(&mut stream, &read_call(1, 0, 4096)).unwrap();
    let (status, mut r) = seek_read_result(&reply);
    assert_eq!(status, NFS4_OK);
    let _eof = r.bool().unwrap();
    assert_eq!(r.opaque(8192).unwrap(), &[0x5Au8; 4096][..]);

    drop(stream);
    assert!(runner.shutdown(Duration::from_secs(5)));
    volume.dismount().unwrap();
}

#[test]
fn dismount_while_client_is_reading() {
    let dir = tempfile::tempdir().unwrap();
    let volume = mounted_volume(&dir);

    let server = NfsServer::bind(volume.translator()).unwrap();
    let port = server.local_port();
    let runner = ServerRunner::spawn(server);

    // A client hammering 4 KiB reads until the server goes away.
    let client = std::thread::spawn(move || {
        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut completed = 0u32;
        for xid in 0u32.. {
            match exchange(&mut stream, &read_call(xid, (xid as u64 % 512) * 4096, 4096)) {
                Ok(reply) => {
                    let (status, _) = seek_read_result(&reply);
                    assert_eq!(status, NFS4_OK);
                    completed += 1;
                }
                // Pending request answered by a closed connection: fine.
                Err(_) => break,
            }
        }
        completed
    });

    std::thread::sleep(Duration::from_millis(200));

    let stop_started = Instant::now();
    assert!(runner.shutdown(Duration::from_secs(5)), "drain must succeed");
    assert!(
        stop_started.elapsed() < Duration::from_secs(1),
        "stop must return promptly"
    );

    let completed = client.join().unwrap();
    assert!(completed > 0, "client must have made progress before dismount");

    // No server handle remains; dropping the engine side wipes the keys.
    volume.dismount().unwrap();

    // The listener is gone with the server.
    assert!(TcpStream::connect((Ipv4Addr::LOCALHOST, port)).is_err());
}
