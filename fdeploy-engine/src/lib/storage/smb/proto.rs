//! SMB2 message encoding and decoding (dialects 2.0.2 and 2.1).
//!
//! Request encoders produce the message body that follows the 64 byte header.
//! Response decoders take the body of a response. Buffer offsets found in
//! responses are relative to the start of the header.
use bytes::{BufMut, BytesMut};
use fdeploy::{io_bail, io_error, NtStatus};

pub const HEADER_LEN: usize = 64;
pub const PROTOCOL_ID: [u8; 4] = [0xFE, b'S', b'M', b'B'];

pub const DIALECT_202: u16 = 0x0202;
pub const DIALECT_210: u16 = 0x0210;
pub const DIALECTS: [u16; 2] = [DIALECT_202, DIALECT_210];

pub const SIGNING_ENABLED: u16 = 0x0001;
pub const SIGNING_REQUIRED: u16 = 0x0002;

pub const CAP_LARGE_MTU: u32 = 0x0000_0004;

pub const FLAG_SERVER_TO_REDIR: u32 = 0x0000_0001;
pub const FLAG_ASYNC_COMMAND: u32 = 0x0000_0002;
pub const FLAG_SIGNED: u32 = 0x0000_0008;

pub const SESSION_FLAG_IS_GUEST: u16 = 0x0001;
pub const SESSION_FLAG_IS_NULL: u16 = 0x0002;

pub const SHARE_TYPE_DISK: u8 = 0x01;
pub const SHARE_TYPE_PIPE: u8 = 0x02;

pub mod access {
    pub const FILE_READ_DATA: u32 = 0x0000_0001;
    pub const FILE_WRITE_DATA: u32 = 0x0000_0002;
    pub const FILE_APPEND_DATA: u32 = 0x0000_0004;
    pub const FILE_READ_EA: u32 = 0x0000_0008;
    pub const FILE_WRITE_EA: u32 = 0x0000_0010;
    pub const FILE_READ_ATTRIBUTES: u32 = 0x0000_0080;
    pub const FILE_WRITE_ATTRIBUTES: u32 = 0x0000_0100;
    pub const DELETE: u32 = 0x0001_0000;
    pub const READ_CONTROL: u32 = 0x0002_0000;
    pub const SYNCHRONIZE: u32 = 0x0010_0000;
    pub const GENERIC_WRITE: u32 = 0x4000_0000;
    pub const GENERIC_READ: u32 = 0x8000_0000;
}

pub mod share {
    pub const READ: u32 = 0x1;
    pub const WRITE: u32 = 0x2;
    pub const DELETE: u32 = 0x4;
    pub const ALL: u32 = READ | WRITE | DELETE;
}

pub mod disposition {
    pub const OPEN: u32 = 1;
    pub const CREATE: u32 = 2;
    pub const OPEN_IF: u32 = 3;
    pub const OVERWRITE_IF: u32 = 5;
}

pub mod options {
    pub const DIRECTORY_FILE: u32 = 0x0000_0001;
    pub const SEQUENTIAL_ONLY: u32 = 0x0000_0004;
    pub const NON_DIRECTORY_FILE: u32 = 0x0000_0040;
}

pub const FILE_ATTRIBUTE_HIDDEN: u32 = 0x0000_0002;
pub const FILE_ATTRIBUTE_DIRECTORY: u32 = 0x0000_0010;

const INFO_FILE: u8 = 0x01;
const FILE_BASIC_INFORMATION: u8 = 0x04;
const FILE_DISPOSITION_INFORMATION: u8 = 0x0D;
const FILE_DIRECTORY_INFORMATION: u8 = 0x01;
const QUERY_RESTART_SCANS: u8 = 0x01;

pub mod status {
    use fdeploy::NtStatus;

    pub const SUCCESS: NtStatus = NtStatus(0x0000_0000);
    pub const PENDING: NtStatus = NtStatus(0x0000_0103);
    pub const BUFFER_OVERFLOW: NtStatus = NtStatus(0x8000_0005);
    pub const NO_MORE_FILES: NtStatus = NtStatus(0x8000_0006);
    pub const NO_SUCH_FILE: NtStatus = NtStatus(0xC000_000F);
    pub const MORE_PROCESSING_REQUIRED: NtStatus = NtStatus(0xC000_0016);
    pub const OBJECT_NAME_NOT_FOUND: NtStatus = NtStatus(0xC000_0034);
    pub const OBJECT_NAME_COLLISION: NtStatus = NtStatus(0xC000_0035);
    pub const OBJECT_PATH_NOT_FOUND: NtStatus = NtStatus(0xC000_003A);
    pub const DELETE_PENDING: NtStatus = NtStatus(0xC000_0056);
    pub const LOGON_FAILURE: NtStatus = NtStatus(0xC000_006D);
    pub const ACCOUNT_DISABLED: NtStatus = NtStatus(0xC000_0072);
    pub const NETWORK_NAME_DELETED: NtStatus = NtStatus(0xC000_00C9);
    pub const BAD_NETWORK_NAME: NtStatus = NtStatus(0xC000_00CC);
    pub const USER_SESSION_DELETED: NtStatus = NtStatus(0xC000_0203);
    pub const NETWORK_SESSION_EXPIRED: NtStatus = NtStatus(0xC000_035C);

    /// The entry does not exist, or one of its parents doesn't.
    pub fn is_not_found(status: NtStatus) -> bool {
        matches!(
            status,
            OBJECT_NAME_NOT_FOUND | OBJECT_PATH_NOT_FOUND | NO_SUCH_FILE | DELETE_PENDING
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    Negotiate = 0x00,
    SessionSetup = 0x01,
    Logoff = 0x02,
    TreeConnect = 0x03,
    TreeDisconnect = 0x04,
    Create = 0x05,
    Close = 0x06,
    Read = 0x08,
    Write = 0x09,
    QueryDirectory = 0x0E,
    SetInfo = 0x11,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    pub credit_charge: u16,
    pub status: NtStatus,
    pub command: u16,
    /// Credits requested, or granted in a response
    pub credits: u16,
    pub flags: u32,
    pub message_id: u64,
    pub async_id: u64,
    pub tree_id: u32,
    pub session_id: u64,
    pub signature: [u8; 16],
}

impl Header {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&PROTOCOL_ID);
        buf.put_u16_le(HEADER_LEN as u16);
        buf.put_u16_le(self.credit_charge);
        buf.put_u32_le(self.status.0);
        buf.put_u16_le(self.command);
        buf.put_u16_le(self.credits);
        buf.put_u32_le(self.flags);
        buf.put_u32_le(0); // next command
        buf.put_u64_le(self.message_id);
        if self.flags & FLAG_ASYNC_COMMAND != 0 {
            buf.put_u64_le(self.async_id);
        } else {
            buf.put_u32_le(0);
            buf.put_u32_le(self.tree_id);
        }
        buf.put_u64_le(self.session_id);
        buf.put_slice(&self.signature);
    }

    pub fn decode(buf: &[u8]) -> fdeploy::Result<Self> {
        if buf.len() < HEADER_LEN || buf[..4] != PROTOCOL_ID {
            io_bail!("not an SMB2 message");
        }
        let flags = le_u32(buf, 16)?;
        let (async_id, tree_id) = if flags & FLAG_ASYNC_COMMAND != 0 {
            (le_u64(buf, 32)?, 0)
        } else {
            (0, le_u32(buf, 36)?)
        };
        let mut signature = [0u8; 16];
        signature.copy_from_slice(&buf[48..64]);
        Ok(Header {
            credit_charge: le_u16(buf, 6)?,
            status: NtStatus(le_u32(buf, 8)?),
            command: le_u16(buf, 12)?,
            credits: le_u16(buf, 14)?,
            flags,
            message_id: le_u64(buf, 24)?,
            async_id,
            tree_id,
            session_id: le_u64(buf, 40)?,
            signature,
        })
    }

    pub fn is_async(&self) -> bool {
        self.flags & FLAG_ASYNC_COMMAND != 0
    }
}

/// Handle of an open file, persistent and volatile parts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileId(pub [u8; 16]);

impl FileId {
    fn decode(buf: &[u8], off: usize) -> fdeploy::Result<Self> {
        let mut id = [0u8; 16];
        id.copy_from_slice(slice(buf, off, 16)?);
        Ok(FileId(id))
    }
}

// requests

pub fn negotiate(client_guid: &[u8; 16]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(36 + 2 * DIALECTS.len());
    buf.put_u16_le(36);
    buf.put_u16_le(DIALECTS.len() as u16);
    buf.put_u16_le(SIGNING_ENABLED);
    buf.put_u16_le(0);
    buf.put_u32_le(0); // capabilities
    buf.put_slice(client_guid);
    buf.put_u64_le(0); // client start time
    for dialect in DIALECTS {
        buf.put_u16_le(dialect);
    }
    buf
}

pub fn session_setup(token: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(24 + token.len());
    buf.put_u16_le(25);
    buf.put_u8(0); // flags
    buf.put_u8(SIGNING_ENABLED as u8);
    buf.put_u32_le(0); // capabilities
    buf.put_u32_le(0); // channel
    buf.put_u16_le((HEADER_LEN + 24) as u16);
    buf.put_u16_le(token.len() as u16);
    buf.put_u64_le(0); // previous session id
    buf.put_slice(token);
    buf
}

/// Body shared by LOGOFF and TREE_DISCONNECT
pub fn empty_request() -> BytesMut {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u16_le(4);
    buf.put_u16_le(0);
    buf
}

/// `unc` is the `\\server\share` path of the share.
pub fn tree_connect(unc: &str) -> BytesMut {
    let path = utf16le(unc);
    let mut buf = BytesMut::with_capacity(8 + path.len());
    buf.put_u16_le(9);
    buf.put_u16_le(0);
    buf.put_u16_le((HEADER_LEN + 8) as u16);
    buf.put_u16_le(path.len() as u16);
    buf.put_slice(&path);
    buf
}

#[derive(Debug, Clone, Copy)]
pub struct CreateRequest<'a> {
    /// Path relative to the share root, with `\` separators
    pub name: &'a str,
    pub access: u32,
    pub attributes: u32,
    pub share_access: u32,
    pub disposition: u32,
    pub options: u32,
}

impl<'a> CreateRequest<'a> {
    pub fn new(name: &'a str, access: u32, disposition: u32, options: u32) -> Self {
        Self {
            name,
            access,
            attributes: 0,
            share_access: share::ALL,
            disposition,
            options,
        }
    }

    pub fn encode(&self) -> BytesMut {
        let name = utf16le(self.name);
        let mut buf = BytesMut::with_capacity(56 + name.len().max(1));
        buf.put_u16_le(57);
        buf.put_u8(0); // security flags
        buf.put_u8(0); // no oplock
        buf.put_u32_le(2); // impersonation
        buf.put_u64_le(0); // create flags
        buf.put_u64_le(0);
        buf.put_u32_le(self.access);
        buf.put_u32_le(self.attributes);
        buf.put_u32_le(self.share_access);
        buf.put_u32_le(self.disposition);
        buf.put_u32_le(self.options);
        buf.put_u16_le((HEADER_LEN + 56) as u16);
        buf.put_u16_le(name.len() as u16);
        buf.put_u32_le(0); // create contexts
        buf.put_u32_le(0);
        if name.is_empty() {
            buf.put_u8(0);
        } else {
            buf.put_slice(&name);
        }
        buf
    }
}

pub fn close(file_id: FileId) -> BytesMut {
    let mut buf = BytesMut::with_capacity(24);
    buf.put_u16_le(24);
    buf.put_u16_le(0);
    buf.put_u32_le(0);
    buf.put_slice(&file_id.0);
    buf
}

pub fn read(file_id: FileId, offset: u64, len: u32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(49);
    buf.put_u16_le(49);
    buf.put_u8(0x50); // padding, data lands right after the response
    buf.put_u8(0);
    buf.put_u32_le(len);
    buf.put_u64_le(offset);
    buf.put_slice(&file_id.0);
    buf.put_u32_le(0); // minimum count
    buf.put_u32_le(0); // channel
    buf.put_u32_le(0); // remaining bytes
    buf.put_u16_le(0);
    buf.put_u16_le(0);
    buf.put_u8(0);
    buf
}

pub fn write(file_id: FileId, offset: u64, data: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(48 + data.len());
    buf.put_u16_le(49);
    buf.put_u16_le((HEADER_LEN + 48) as u16);
    buf.put_u32_le(data.len() as u32);
    buf.put_u64_le(offset);
    buf.put_slice(&file_id.0);
    buf.put_u32_le(0); // channel
    buf.put_u32_le(0); // remaining bytes
    buf.put_u16_le(0);
    buf.put_u16_le(0);
    buf.put_u32_le(0); // flags
    buf.put_slice(data);
    buf
}

pub fn query_directory(file_id: FileId, restart: bool, pattern: &str, out_len: u32) -> BytesMut {
    let pattern = utf16le(pattern);
    let mut buf = BytesMut::with_capacity(32 + pattern.len());
    buf.put_u16_le(33);
    buf.put_u8(FILE_DIRECTORY_INFORMATION);
    buf.put_u8(if restart { QUERY_RESTART_SCANS } else { 0 });
    buf.put_u32_le(0); // file index
    buf.put_slice(&file_id.0);
    buf.put_u16_le((HEADER_LEN + 32) as u16);
    buf.put_u16_le(pattern.len() as u16);
    buf.put_u32_le(out_len);
    buf.put_slice(&pattern);
    buf
}

fn set_info(file_id: FileId, class: u8, info: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(32 + info.len());
    buf.put_u16_le(33);
    buf.put_u8(INFO_FILE);
    buf.put_u8(class);
    buf.put_u32_le(info.len() as u32);
    buf.put_u16_le((HEADER_LEN + 32) as u16);
    buf.put_u16_le(0);
    buf.put_u32_le(0); // additional information
    buf.put_slice(&file_id.0);
    buf.put_slice(info);
    buf
}

/// Sets the last write time, leaving the other timestamps and attributes as they are.
pub fn set_last_write_time(file_id: FileId, filetime: u64) -> BytesMut {
    let mut info = BytesMut::with_capacity(40);
    info.put_u64_le(0); // creation
    info.put_u64_le(0); // last access
    info.put_u64_le(filetime);
    info.put_u64_le(0); // change
    info.put_u32_le(0); // attributes
    info.put_u32_le(0);
    set_info(file_id, FILE_BASIC_INFORMATION, &info)
}

pub fn set_delete_pending(file_id: FileId) -> BytesMut {
    set_info(file_id, FILE_DISPOSITION_INFORMATION, &[1])
}

// responses

#[derive(Debug, Clone)]
pub struct NegotiateResponse {
    pub security_mode: u16,
    pub dialect: u16,
    pub capabilities: u32,
    pub max_transact_size: u32,
    pub max_read_size: u32,
    pub max_write_size: u32,
}

impl NegotiateResponse {
    pub fn decode(body: &[u8]) -> fdeploy::Result<Self> {
        expect_structure_size(body, 65, "NEGOTIATE")?;
        Ok(Self {
            security_mode: le_u16(body, 2)?,
            dialect: le_u16(body, 4)?,
            capabilities: le_u32(body, 24)?,
            max_transact_size: le_u32(body, 28)?,
            max_read_size: le_u32(body, 32)?,
            max_write_size: le_u32(body, 36)?,
        })
    }

    pub fn signing_required(&self) -> bool {
        self.security_mode & SIGNING_REQUIRED != 0
    }
}

#[derive(Debug, Clone)]
pub struct SessionSetupResponse<'a> {
    pub session_flags: u16,
    pub token: &'a [u8],
}

impl<'a> SessionSetupResponse<'a> {
    pub fn decode(body: &'a [u8]) -> fdeploy::Result<Self> {
        expect_structure_size(body, 9, "SESSION_SETUP")?;
        let session_flags = le_u16(body, 2)?;
        let offset = le_u16(body, 4)? as usize;
        let len = le_u16(body, 6)? as usize;
        let token = if len == 0 {
            &[][..]
        } else {
            slice(body, offset.saturating_sub(HEADER_LEN), len)?
        };
        Ok(Self {
            session_flags,
            token,
        })
    }
}

pub fn tree_connect_share_type(body: &[u8]) -> fdeploy::Result<u8> {
    expect_structure_size(body, 16, "TREE_CONNECT")?;
    Ok(body[2])
}

#[derive(Debug, Clone)]
pub struct CreateResponse {
    pub creation_time: u64,
    pub last_write_time: u64,
    pub end_of_file: u64,
    pub attributes: u32,
    pub file_id: FileId,
}

impl CreateResponse {
    pub fn decode(body: &[u8]) -> fdeploy::Result<Self> {
        expect_structure_size(body, 89, "CREATE")?;
        Ok(Self {
            creation_time: le_u64(body, 8)?,
            last_write_time: le_u64(body, 24)?,
            end_of_file: le_u64(body, 48)?,
            attributes: le_u32(body, 56)?,
            file_id: FileId::decode(body, 64)?,
        })
    }

    pub fn is_dir(&self) -> bool {
        self.attributes & FILE_ATTRIBUTE_DIRECTORY != 0
    }
}

pub fn write_count(body: &[u8]) -> fdeploy::Result<u32> {
    expect_structure_size(body, 17, "WRITE")?;
    le_u32(body, 4)
}

pub fn read_data(body: &[u8]) -> fdeploy::Result<&[u8]> {
    expect_structure_size(body, 17, "READ")?;
    let offset = body[2] as usize;
    let len = le_u32(body, 4)? as usize;
    if len == 0 {
        return Ok(&[]);
    }
    slice(body, offset.saturating_sub(HEADER_LEN), len)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub creation_time: u64,
    pub last_write_time: u64,
    pub end_of_file: u64,
    pub attributes: u32,
}

impl DirectoryEntry {
    pub fn is_dir(&self) -> bool {
        self.attributes & FILE_ATTRIBUTE_DIRECTORY != 0
    }
}

/// Decodes the FileDirectoryInformation entries of a QUERY_DIRECTORY response.
pub fn directory_entries(body: &[u8]) -> fdeploy::Result<Vec<DirectoryEntry>> {
    expect_structure_size(body, 9, "QUERY_DIRECTORY")?;
    let offset = le_u16(body, 2)? as usize;
    let len = le_u32(body, 4)? as usize;
    if len == 0 {
        return Ok(Vec::new());
    }
    let buf = slice(body, offset.saturating_sub(HEADER_LEN), len)?;

    let mut entries = Vec::new();
    let mut pos = 0;
    loop {
        let entry = slice(buf, pos, 64)?;
        let next = le_u32(entry, 0)? as usize;
        let name_len = le_u32(entry, 60)? as usize;
        let name = from_utf16le(slice(buf, pos + 64, name_len)?)?;
        entries.push(DirectoryEntry {
            name,
            creation_time: le_u64(entry, 8)?,
            last_write_time: le_u64(entry, 24)?,
            end_of_file: le_u64(entry, 40)?,
            attributes: le_u32(entry, 56)?,
        });
        if next == 0 {
            break;
        }
        pos += next;
    }
    Ok(entries)
}

// helpers

const FILETIME_UNIX_EPOCH: i64 = 11_644_473_600;
const FILETIME_TICKS_PER_SEC: i64 = 10_000_000;

/// Converts Unix seconds to a FILETIME (100ns ticks since 1601-01-01).
pub fn filetime(unix_secs: i64) -> u64 {
    ((unix_secs + FILETIME_UNIX_EPOCH).max(0) * FILETIME_TICKS_PER_SEC) as u64
}

/// Converts a FILETIME to Unix seconds, dropping the sub-second part.
pub fn unix_time(filetime: u64) -> i64 {
    (filetime / FILETIME_TICKS_PER_SEC as u64) as i64 - FILETIME_UNIX_EPOCH
}

pub fn utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|c| c.to_le_bytes()).collect()
}

pub fn from_utf16le(buf: &[u8]) -> fdeploy::Result<String> {
    if buf.len() % 2 != 0 {
        io_bail!("odd length UTF-16 string");
    }
    let units: Vec<u16> = buf
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).map_err(|err| fdeploy::Error::Utf8(err.to_string()))
}

pub fn slice(buf: &[u8], off: usize, len: usize) -> fdeploy::Result<&[u8]> {
    off.checked_add(len)
        .and_then(|end| buf.get(off..end))
        .ok_or_else(|| io_error!("truncated message: {len} bytes at offset {off}"))
}

pub fn le_u16(buf: &[u8], off: usize) -> fdeploy::Result<u16> {
    let b = slice(buf, off, 2)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

pub fn le_u32(buf: &[u8], off: usize) -> fdeploy::Result<u32> {
    let b = slice(buf, off, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

pub fn le_u64(buf: &[u8], off: usize) -> fdeploy::Result<u64> {
    let b = slice(buf, off, 8)?;
    let mut a = [0u8; 8];
    a.copy_from_slice(b);
    Ok(u64::from_le_bytes(a))
}

fn expect_structure_size(body: &[u8], size: u16, what: &str) -> fdeploy::Result<()> {
    let actual = le_u16(body, 0)?;
    if actual != size {
        io_bail!("unexpected {what} response structure size {actual}");
    }
    Ok(())
}
