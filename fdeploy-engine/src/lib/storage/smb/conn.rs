//! A single SMB2 connection: framing, credits, signing and session setup.
//!
//! Requests are sent one at a time, a connection is owned by one worker.
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;
use fdeploy::{protocol_error, Error, NtStatus};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time,
};

use super::{
    ntlm::{self, spnego, Challenge},
    proto::{
        self, status, Command, CreateRequest, CreateResponse, DirectoryEntry, FileId, Header,
        NegotiateResponse, SessionSetupResponse, CAP_LARGE_MTU, DIALECT_210, FLAG_SIGNED,
        HEADER_LEN, SESSION_FLAG_IS_GUEST, SESSION_FLAG_IS_NULL,
    },
};

type HmacSha256 = Hmac<Sha256>;

const CREDITS_REQUESTED: u16 = 64;
const CREDIT_UNIT: usize = 65536;
const MAX_CHUNK: usize = 1024 * 1024;
const QUERY_DIRECTORY_LEN: u32 = 65536;

/// A decoded response, the body follows the header
#[derive(Debug)]
pub struct Response {
    pub header: Header,
    buf: Bytes,
}

impl Response {
    pub fn status(&self) -> NtStatus {
        self.header.status
    }

    pub fn body(&self) -> &[u8] {
        &self.buf[HEADER_LEN..]
    }
}

/// Maps a failing status to the error kind the engine acts upon.
pub fn status_error(status: NtStatus, context: impl Into<String>) -> Error {
    let context = context.into();
    match status {
        status::USER_SESSION_DELETED
        | status::NETWORK_NAME_DELETED
        | status::NETWORK_SESSION_EXPIRED => Error::Disconnected(format!("{context}: {status}")),
        status::LOGON_FAILURE | status::ACCOUNT_DISABLED => {
            Error::Auth(format!("{context}: {status}"))
        }
        status::BAD_NETWORK_NAME => Error::ShareNotFound(context),
        status => protocol_error!(status, "{context}"),
    }
}

fn check(resp: &Response, context: impl FnOnce() -> String) -> fdeploy::Result<()> {
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(status_error(resp.status(), context()))
    }
}

/// Current time as a FILETIME
fn filetime_now() -> u64 {
    let now = Utc::now();
    proto::filetime(now.timestamp()) + u64::from(now.timestamp_subsec_nanos() / 100)
}

#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    server: String,
    response_timeout: Duration,
    message_id: u64,
    credits: u32,
    session_id: u64,
    signing_required: bool,
    signing_key: Option<[u8; 16]>,
    large_mtu: bool,
    max_read: u32,
    max_write: u32,
}

impl Connection {
    /// Opens the TCP connection and negotiates the dialect.
    /// A server that does not accept the connection in time is unreachable.
    pub async fn connect(
        server: &str,
        port: u16,
        connect_timeout: Duration,
        response_timeout: Duration,
    ) -> fdeploy::Result<Self> {
        log::debug!("connecting to {server}:{port}");
        let stream = match time::timeout(connect_timeout, TcpStream::connect((server, port))).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(Error::Unreachable(format!("{server}:{port}: {err}"))),
            Err(_) => {
                return Err(Error::Unreachable(format!(
                    "{server}:{port}: no answer within {}ms",
                    connect_timeout.as_millis()
                )))
            }
        };
        stream.set_nodelay(true)?;

        let mut conn = Connection {
            stream,
            server: server.to_string(),
            response_timeout,
            message_id: 0,
            credits: 1,
            session_id: 0,
            signing_required: false,
            signing_key: None,
            large_mtu: false,
            max_read: CREDIT_UNIT as u32,
            max_write: CREDIT_UNIT as u32,
        };
        conn.negotiate().await?;
        Ok(conn)
    }

    async fn negotiate(&mut self) -> fdeploy::Result<()> {
        let mut client_guid = [0u8; 16];
        rand::thread_rng().fill(&mut client_guid);
        let resp = self
            .request(Command::Negotiate, 0, proto::negotiate(&client_guid), 0)
            .await?;
        check(&resp, || "NEGOTIATE".to_string())?;
        let neg = NegotiateResponse::decode(resp.body())?;
        log::debug!(
            "negotiated dialect 0x{:04x} with {}, signing {}",
            neg.dialect,
            self.server,
            if neg.signing_required() { "required" } else { "optional" }
        );
        self.signing_required = neg.signing_required();
        self.large_mtu = neg.dialect == DIALECT_210 && neg.capabilities & CAP_LARGE_MTU != 0;
        self.max_read = neg.max_read_size;
        self.max_write = neg.max_write_size;
        Ok(())
    }

    /// NTLMv2 authentication through SPNEGO.
    pub async fn login(&mut self, user: &str, password: &str, domain: &str) -> fdeploy::Result<()> {
        let token = spnego::init(&ntlm::negotiate());
        let resp = self
            .request(Command::SessionSetup, 0, proto::session_setup(&token), 0)
            .await?;
        if resp.status() != status::MORE_PROCESSING_REQUIRED {
            return Err(match status_error(resp.status(), "SESSION_SETUP") {
                err @ Error::Auth(..) => err,
                err => Error::Auth(err.to_string()),
            });
        }
        self.session_id = resp.header.session_id;

        let setup = SessionSetupResponse::decode(resp.body())?;
        let challenge = spnego::find_ntlmssp(setup.token)
            .ok_or_else(|| Error::Auth("server did not send an NTLM challenge".into()))?;
        let challenge = Challenge::decode(challenge)?;

        let mut client_challenge = [0u8; 8];
        rand::thread_rng().fill(&mut client_challenge);
        let creds = ntlm::Credentials {
            user,
            password,
            domain,
        };
        let auth = creds.authenticate(&challenge, client_challenge, filetime_now());

        let token = spnego::response(&auth.message);
        let resp = self
            .request(Command::SessionSetup, 0, proto::session_setup(&token), 0)
            .await?;
        if !resp.status().is_success() {
            return Err(Error::Auth(format!("{}\\{}: {}", domain, user, resp.status())));
        }
        let setup = SessionSetupResponse::decode(resp.body())?;
        let anonymous = setup.session_flags & (SESSION_FLAG_IS_GUEST | SESSION_FLAG_IS_NULL) != 0;
        if self.signing_required && !anonymous {
            self.signing_key = Some(auth.session_key);
        }
        log::debug!("logged in {} as {domain}\\{user}", self.server);
        Ok(())
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Connects the share and returns its tree id.
    pub async fn tree_connect(&mut self, share: &str) -> fdeploy::Result<u32> {
        let unc = format!("\\\\{}\\{}", self.server, share);
        let resp = self
            .request(Command::TreeConnect, 0, proto::tree_connect(&unc), 0)
            .await?;
        if resp.status() == status::BAD_NETWORK_NAME {
            return Err(Error::ShareNotFound(unc));
        }
        check(&resp, || format!("TREE_CONNECT {unc}"))?;
        proto::tree_connect_share_type(resp.body())?;
        Ok(resp.header.tree_id)
    }

    pub async fn tree_disconnect(&mut self, tree_id: u32) -> fdeploy::Result<()> {
        let resp = self
            .request(Command::TreeDisconnect, tree_id, proto::empty_request(), 0)
            .await?;
        check(&resp, || "TREE_DISCONNECT".to_string())
    }

    pub async fn logoff(&mut self) -> fdeploy::Result<()> {
        let resp = self
            .request(Command::Logoff, 0, proto::empty_request(), 0)
            .await?;
        check(&resp, || "LOGOFF".to_string())?;
        self.session_id = 0;
        self.signing_key = None;
        Ok(())
    }

    /// Opens or creates a file. A failing status is returned as an error.
    pub async fn create(
        &mut self,
        tree_id: u32,
        req: &CreateRequest<'_>,
    ) -> fdeploy::Result<CreateResponse> {
        let resp = self.request(Command::Create, tree_id, req.encode(), 0).await?;
        check(&resp, || format!("Could not open `{}`", req.name))?;
        CreateResponse::decode(resp.body())
    }

    pub async fn close(&mut self, tree_id: u32, file_id: FileId) -> fdeploy::Result<()> {
        let resp = self
            .request(Command::Close, tree_id, proto::close(file_id), 0)
            .await?;
        check(&resp, || "CLOSE".to_string())
    }

    /// Writes a chunk, no larger than [`Connection::chunk_size`].
    pub async fn write(
        &mut self,
        tree_id: u32,
        file_id: FileId,
        offset: u64,
        data: &[u8],
    ) -> fdeploy::Result<u32> {
        let resp = self
            .request(Command::Write, tree_id, proto::write(file_id, offset, data), 0)
            .await?;
        check(&resp, || format!("WRITE at offset {offset}"))?;
        proto::write_count(resp.body())
    }

    /// Reads up to `len` bytes. Returns the status alongside the data as
    /// `STATUS_BUFFER_OVERFLOW` means more data is waiting on a pipe.
    pub async fn read(
        &mut self,
        tree_id: u32,
        file_id: FileId,
        offset: u64,
        len: u32,
    ) -> fdeploy::Result<(NtStatus, Bytes)> {
        let len = len.min(self.max_read);
        let resp = self
            .request(
                Command::Read,
                tree_id,
                proto::read(file_id, offset, len),
                len as usize,
            )
            .await?;
        let status = resp.status();
        if !status.is_success() && status != status::BUFFER_OVERFLOW {
            return Err(status_error(status, format!("READ at offset {offset}")));
        }
        let data = Bytes::copy_from_slice(proto::read_data(resp.body())?);
        Ok((status, data))
    }

    /// Next batch of entries of an open directory, `None` once exhausted.
    pub async fn query_directory(
        &mut self,
        tree_id: u32,
        file_id: FileId,
        restart: bool,
    ) -> fdeploy::Result<Option<Vec<DirectoryEntry>>> {
        let out_len = QUERY_DIRECTORY_LEN.min(self.max_read);
        let resp = self
            .request(
                Command::QueryDirectory,
                tree_id,
                proto::query_directory(file_id, restart, "*", out_len),
                out_len as usize,
            )
            .await?;
        if resp.status() == status::NO_MORE_FILES {
            return Ok(None);
        }
        check(&resp, || "QUERY_DIRECTORY".to_string())?;
        proto::directory_entries(resp.body()).map(Some)
    }

    /// Sends a SET_INFO request built by [`proto::set_last_write_time`] or
    /// [`proto::set_delete_pending`].
    pub async fn set_info(&mut self, tree_id: u32, body: BytesMut) -> fdeploy::Result<()> {
        let resp = self.request(Command::SetInfo, tree_id, body, 0).await?;
        check(&resp, || "SET_INFO".to_string())
    }

    /// Largest write the server accepts given the credits at hand
    pub fn chunk_size(&self) -> usize {
        let size = MAX_CHUNK.min(self.max_write as usize);
        if self.large_mtu {
            size.min(self.credits.max(1) as usize * CREDIT_UNIT)
        } else {
            size.min(CREDIT_UNIT)
        }
    }

    fn credit_charge(&self, payload: usize, response: usize) -> u16 {
        if !self.large_mtu {
            return 0;
        }
        let len = payload.max(response).max(1);
        len.div_ceil(CREDIT_UNIT).max(1) as u16
    }

    /// Sends one request and waits for its final response, whatever its status.
    pub async fn request(
        &mut self,
        command: Command,
        tree_id: u32,
        body: BytesMut,
        response_len: usize,
    ) -> fdeploy::Result<Response> {
        let charge = self.credit_charge(body.len(), response_len);
        let message_id = self.message_id;
        self.message_id += u64::from(charge.max(1));
        self.credits = self.credits.saturating_sub(u32::from(charge.max(1)));

        let header = Header {
            credit_charge: charge,
            command: command as u16,
            credits: CREDITS_REQUESTED,
            message_id,
            tree_id,
            session_id: self.session_id,
            ..Header::default()
        };
        self.send(header, &body).await?;

        loop {
            let frame = time::timeout(self.response_timeout, self.read_frame())
                .await
                .map_err(|_| {
                    Error::Timeout(format!(
                        "no response from {} to {:?} within {}ms",
                        self.server,
                        command,
                        self.response_timeout.as_millis()
                    ))
                })??;
            let header = Header::decode(&frame)?;
            self.credits = self.credits.saturating_add(u32::from(header.credits));
            if header.message_id != message_id {
                log::debug!(
                    "ignoring response to message {} while waiting for {message_id}",
                    header.message_id
                );
                continue;
            }
            if header.status == status::PENDING {
                log::trace!("{:?} pending", command);
                continue;
            }
            return Ok(Response { header, buf: frame });
        }
    }

    async fn send(&mut self, mut header: Header, body: &[u8]) -> fdeploy::Result<()> {
        let sign = self.signing_key.is_some() && self.session_id != 0;
        if sign {
            header.flags |= FLAG_SIGNED;
        }
        let len = HEADER_LEN + body.len();
        let mut msg = BytesMut::with_capacity(4 + len);
        msg.put_u32(len as u32); // NetBIOS session message, type 0
        header.encode(&mut msg);
        msg.put_slice(body);

        if let (true, Some(key)) = (sign, &self.signing_key) {
            let signature = sign_message(key, &msg[4..]);
            msg[4 + 48..4 + 64].copy_from_slice(&signature);
        }
        self.stream.write_all(&msg).await?;
        Ok(())
    }

    async fn read_frame(&mut self) -> fdeploy::Result<Bytes> {
        let mut len = [0u8; 4];
        self.stream.read_exact(&mut len).await?;
        let len = u32::from_be_bytes([0, len[1], len[2], len[3]]) as usize;
        let mut frame = BytesMut::zeroed(len);
        self.stream.read_exact(&mut frame).await?;
        Ok(frame.freeze())
    }
}

/// SMB 2.x signature: HMAC-SHA256 of the message with a zeroed signature field
pub fn sign_message(key: &[u8; 16], msg: &[u8]) -> [u8; 16] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(&msg[..48]);
    mac.update(&[0u8; 16]);
    mac.update(&msg[HEADER_LEN.min(msg.len())..]);
    let digest = mac.finalize().into_bytes();
    let mut signature = [0u8; 16];
    signature.copy_from_slice(&digest[..16]);
    signature
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert!(matches!(
            status_error(status::NETWORK_NAME_DELETED, "x"),
            Error::Disconnected(..)
        ));
        assert!(matches!(
            status_error(status::USER_SESSION_DELETED, "x"),
            Error::Disconnected(..)
        ));
        assert!(matches!(
            status_error(status::LOGON_FAILURE, "x"),
            Error::Auth(..)
        ));
        assert!(matches!(
            status_error(status::BAD_NETWORK_NAME, "x"),
            Error::ShareNotFound(..)
        ));
        let err = status_error(status::OBJECT_NAME_COLLISION, "mkdir");
        assert_eq!(err.status(), Some(status::OBJECT_NAME_COLLISION));
        assert!(err.is_retryable());
    }

    #[test]
    fn signature_ignores_previous_signature_field() {
        let key = [3u8; 16];
        let mut msg = BytesMut::new();
        Header {
            command: Command::Write as u16,
            message_id: 12,
            session_id: 99,
            flags: FLAG_SIGNED,
            ..Header::default()
        }
        .encode(&mut msg);
        msg.put_slice(b"payload");

        let first = sign_message(&key, &msg);
        msg[48..64].copy_from_slice(&first);
        assert_eq!(sign_message(&key, &msg), first);

        msg[70] ^= 1;
        assert_ne!(sign_message(&key, &msg), first);
    }

    #[test]
    fn filetime_now_is_after_2020() {
        assert!(filetime_now() > proto::filetime(1_577_836_800));
    }
}
