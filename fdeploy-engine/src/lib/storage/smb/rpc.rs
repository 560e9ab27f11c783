//! Share enumeration through the server service (srvsvc) named pipe.
//!
//! Only what is needed for `NetrShareEnum` at level 1 is implemented:
//! DCE/RPC bind and request over `\\server\IPC$`, no authentication verifier.
use bytes::{BufMut, BytesMut};
use fdeploy::io_bail;

use super::{
    conn::Connection,
    proto::{access, disposition, from_utf16le, le_u16, le_u32, share, slice, utf16le, CreateRequest, FileId},
};

const PIPE: &str = "srvsvc";

const MAX_FRAG: u16 = 4280;

const PTYPE_REQUEST: u8 = 0;
const PTYPE_RESPONSE: u8 = 2;
const PTYPE_FAULT: u8 = 3;
const PTYPE_BIND: u8 = 11;
const PTYPE_BIND_ACK: u8 = 12;

const PFC_FIRST_FRAG: u8 = 0x01;
const PFC_LAST_FRAG: u8 = 0x02;

const SRVSVC_UUID: [u8; 16] = [
    0xc8, 0x4f, 0x32, 0x4b, 0x70, 0x16, 0xd3, 0x01, 0x12, 0x78, 0x5a, 0x47, 0xbf, 0x6e, 0xe1, 0x88,
];
const NDR_UUID: [u8; 16] = [
    0x04, 0x5d, 0x88, 0x8a, 0xeb, 0x1c, 0xc9, 0x11, 0x9f, 0xe8, 0x08, 0x00, 0x2b, 0x10, 0x48, 0x60,
];

const OPNUM_NETR_SHARE_ENUM: u16 = 15;

/// Names of the shares exposed by the server of `conn`.
pub async fn share_names(conn: &mut Connection) -> fdeploy::Result<Vec<String>> {
    let tree_id = conn.tree_connect("IPC$").await?;
    let res = enumerate(conn, tree_id).await;
    if let Err(err) = conn.tree_disconnect(tree_id).await {
        log::debug!("IPC$ disconnect failed: {err}");
    }
    res
}

async fn enumerate(conn: &mut Connection, tree_id: u32) -> fdeploy::Result<Vec<String>> {
    let mut req = CreateRequest::new(
        PIPE,
        access::FILE_READ_DATA
            | access::FILE_WRITE_DATA
            | access::FILE_APPEND_DATA
            | access::FILE_READ_EA
            | access::FILE_WRITE_EA
            | access::FILE_READ_ATTRIBUTES
            | access::FILE_WRITE_ATTRIBUTES
            | access::READ_CONTROL
            | access::SYNCHRONIZE,
        disposition::OPEN,
        0,
    );
    req.share_access = share::READ | share::WRITE;
    let file_id = conn.create(tree_id, &req).await?.file_id;

    let res = async {
        let (ptype, ack) = transact(conn, tree_id, file_id, &bind(1)).await?;
        if ptype != PTYPE_BIND_ACK {
            io_bail!("expected a bind_ack PDU, got type {ptype}");
        }
        check_bind_ack(&ack)?;

        let server = format!("\\\\{}", conn.server());
        let pdu = request(2, OPNUM_NETR_SHARE_ENUM, &share_enum_stub(&server));
        let (ptype, stub) = transact(conn, tree_id, file_id, &pdu).await?;
        if ptype != PTYPE_RESPONSE {
            io_bail!("expected a response PDU, got type {ptype}");
        }
        parse_share_enum(&stub)
    }
    .await;

    if let Err(err) = conn.close(tree_id, file_id).await {
        log::debug!("could not close {PIPE} pipe: {err}");
    }
    res
}

/// Writes a PDU and reads back the answer.
/// Response fragments are reassembled into their stub data, other PDU types
/// are returned whole.
async fn transact(
    conn: &mut Connection,
    tree_id: u32,
    file_id: FileId,
    pdu: &[u8],
) -> fdeploy::Result<(u8, Vec<u8>)> {
    let written = conn.write(tree_id, file_id, 0, pdu).await?;
    if written as usize != pdu.len() {
        io_bail!("short write on {PIPE} pipe: {written} of {}", pdu.len());
    }

    let mut pending = Vec::new();
    let mut stub = Vec::new();
    loop {
        let len = loop {
            if let Some(len) = complete_fragment(&pending)? {
                break len;
            }
            let (_, data) = conn.read(tree_id, file_id, 0, u32::from(MAX_FRAG)).await?;
            if data.is_empty() {
                io_bail!("{PIPE} pipe returned no data mid PDU");
            }
            pending.extend_from_slice(&data);
        };
        let frag: Vec<u8> = pending.drain(..len).collect();
        match frag[2] {
            PTYPE_FAULT => {
                io_bail!("RPC fault 0x{:08x}", le_u32(&frag, 24)?);
            }
            PTYPE_RESPONSE => {
                let auth_len = le_u16(&frag, 10)? as usize;
                let end = len.saturating_sub(auth_len);
                stub.extend_from_slice(slice(&frag, 24, end.saturating_sub(24))?);
                if frag[3] & PFC_LAST_FRAG != 0 {
                    return Ok((PTYPE_RESPONSE, stub));
                }
            }
            ptype => return Ok((ptype, frag)),
        }
    }
}

/// Length of the first fragment of `buf` if it is complete
fn complete_fragment(buf: &[u8]) -> fdeploy::Result<Option<usize>> {
    if buf.len() < 16 {
        return Ok(None);
    }
    if buf[0] != 5 || buf[1] != 0 {
        io_bail!("not a DCE/RPC v5.0 PDU");
    }
    let len = le_u16(buf, 8)? as usize;
    if len < 16 {
        io_bail!("invalid DCE/RPC fragment length {len}");
    }
    Ok((buf.len() >= len).then_some(len))
}

fn put_common_header(buf: &mut BytesMut, ptype: u8, frag_len: usize, call_id: u32) {
    buf.put_u8(5);
    buf.put_u8(0);
    buf.put_u8(ptype);
    buf.put_u8(PFC_FIRST_FRAG | PFC_LAST_FRAG);
    buf.put_slice(&[0x10, 0, 0, 0]); // little endian, ASCII, IEEE
    buf.put_u16_le(frag_len as u16);
    buf.put_u16_le(0); // auth length
    buf.put_u32_le(call_id);
}

fn bind(call_id: u32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(72);
    put_common_header(&mut buf, PTYPE_BIND, 72, call_id);
    buf.put_u16_le(MAX_FRAG);
    buf.put_u16_le(MAX_FRAG);
    buf.put_u32_le(0); // association group
    buf.put_u8(1); // context items
    buf.put_slice(&[0; 3]);
    buf.put_u16_le(0); // context id
    buf.put_u8(1); // transfer syntaxes
    buf.put_u8(0);
    buf.put_slice(&SRVSVC_UUID);
    buf.put_u16_le(3);
    buf.put_u16_le(0);
    buf.put_slice(&NDR_UUID);
    buf.put_u32_le(2);
    buf
}

fn check_bind_ack(pdu: &[u8]) -> fdeploy::Result<()> {
    let sec_addr_len = le_u16(pdu, 24)? as usize;
    let pos = (26 + sec_addr_len + 3) & !3;
    let results = slice(pdu, pos, 1)?[0];
    if results == 0 {
        io_bail!("bind_ack without result");
    }
    let result = le_u16(pdu, pos + 4)?;
    if result != 0 {
        io_bail!("srvsvc bind rejected, result {result}");
    }
    Ok(())
}

fn request(call_id: u32, opnum: u16, stub: &[u8]) -> BytesMut {
    let len = 24 + stub.len();
    let mut buf = BytesMut::with_capacity(len);
    put_common_header(&mut buf, PTYPE_REQUEST, len, call_id);
    buf.put_u32_le(stub.len() as u32); // alloc hint
    buf.put_u16_le(0); // context id
    buf.put_u16_le(opnum);
    buf.put_slice(stub);
    buf
}

fn put_ndr_string(buf: &mut BytesMut, s: &str) {
    let mut units = utf16le(s);
    units.extend_from_slice(&[0, 0]);
    let count = (units.len() / 2) as u32;
    buf.put_u32_le(count);
    buf.put_u32_le(0);
    buf.put_u32_le(count);
    buf.put_slice(&units);
    while buf.len() % 4 != 0 {
        buf.put_u8(0);
    }
}

/// `NetrShareEnum` request at level 1, asking for every share at once.
fn share_enum_stub(server: &str) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u32_le(0x0002_0000);
    put_ndr_string(&mut buf, server);
    buf.put_u32_le(1); // level
    buf.put_u32_le(1); // union switch
    buf.put_u32_le(0x0002_0004); // container
    buf.put_u32_le(0); // entries read
    buf.put_u32_le(0); // null buffer
    buf.put_u32_le(u32::MAX); // preferred maximum length
    buf.put_u32_le(0x0002_0008); // resume handle
    buf.put_u32_le(0);
    buf
}

struct NdrReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> NdrReader<'a> {
    fn u32(&mut self) -> fdeploy::Result<u32> {
        self.align(4);
        let v = le_u32(self.buf, self.pos)?;
        self.pos += 4;
        Ok(v)
    }

    fn align(&mut self, n: usize) {
        self.pos = (self.pos + n - 1) & !(n - 1);
    }

    fn string(&mut self) -> fdeploy::Result<String> {
        let _max = self.u32()?;
        let _offset = self.u32()?;
        let actual = self.u32()? as usize;
        let units = slice(self.buf, self.pos, actual * 2)?;
        self.pos += actual * 2;
        let s = from_utf16le(units)?;
        Ok(s.trim_end_matches('\0').to_string())
    }
}

fn parse_share_enum(stub: &[u8]) -> fdeploy::Result<Vec<String>> {
    if stub.len() >= 4 {
        let werror = le_u32(stub, stub.len() - 4)?;
        if werror != 0 {
            io_bail!("NetrShareEnum failed with error 0x{werror:08x}");
        }
    }
    let mut r = NdrReader { buf: stub, pos: 0 };
    let level = r.u32()?;
    let _switch = r.u32()?;
    if level != 1 {
        io_bail!("unexpected share info level {level}");
    }
    if r.u32()? == 0 {
        return Ok(Vec::new());
    }
    let count = r.u32()? as usize;
    if r.u32()? == 0 {
        return Ok(Vec::new());
    }
    let _max_count = r.u32()?;

    let mut refs = Vec::with_capacity(count);
    for _ in 0..count {
        let name = r.u32()?;
        let _share_type = r.u32()?;
        let remark = r.u32()?;
        refs.push((name != 0, remark != 0));
    }
    let mut names = Vec::with_capacity(count);
    for (has_name, has_remark) in refs {
        if has_name {
            names.push(r.string()?);
        }
        if has_remark {
            r.string()?;
        }
    }
    Ok(names)
}
