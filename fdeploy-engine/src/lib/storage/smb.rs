//! Storage speaking SMB2 directly to the file server.
//!
//! A [`Smb2`] storage owns one authenticated session with the share connected.
//! Transport failures drop the session, the next call reconnects.
use std::time::Duration;

use async_stream::try_stream;
use fdeploy::{
    config::ServerConnection, local_error, path::Path, Entry, EntryKind, Error,
};
use futures::Stream;
use tokio::{
    io::{self, AsyncRead, AsyncReadExt},
    sync::{Mutex, MutexGuard},
};

use crate::Shutdown;

use self::{
    conn::Connection,
    proto::{access, disposition, options, status, CreateRequest, CreateResponse, FileId},
};

pub mod conn;
pub mod ntlm;
pub mod proto;
pub mod rpc;

/// Parameters to open SMB2 sessions on a share
#[derive(Debug, Clone)]
pub struct Connector {
    server: String,
    port: u16,
    share: String,
    domain: String,
    user: String,
    password: String,
    connect_timeout: Duration,
    response_timeout: Duration,
    verify_share: bool,
}

impl Connector {
    pub fn new(config: &ServerConnection) -> Self {
        Self {
            server: config.server_address.clone(),
            port: config.port,
            share: config.share_name.clone(),
            domain: config.domain.clone(),
            user: config.user_name.clone(),
            password: config.password.clone(),
            connect_timeout: config.connect_timeout(),
            response_timeout: config.response_timeout(),
            verify_share: config.verify_share,
        }
    }

    async fn open(&self) -> fdeploy::Result<Session> {
        let mut conn = Connection::connect(
            &self.server,
            self.port,
            self.connect_timeout,
            self.response_timeout,
        )
        .await?;
        conn.login(&self.user, &self.password, &self.domain).await?;

        if self.verify_share {
            let shares = rpc::share_names(&mut conn).await?;
            log::debug!("shares of {}: {}", self.server, shares.join(", "));
            if !shares.iter().any(|s| s.eq_ignore_ascii_case(&self.share)) {
                return Err(Error::ShareNotFound(format!(
                    "\\\\{}\\{}",
                    self.server, self.share
                )));
            }
        }

        let tree_id = conn.tree_connect(&self.share).await?;
        log::info!("connected to \\\\{}\\{}", self.server, self.share);
        Ok(Session { conn, tree_id })
    }
}

impl super::Connect for Connector {
    type Storage = Smb2;

    async fn connect(&self) -> fdeploy::Result<Smb2> {
        let session = self.open().await?;
        Ok(Smb2 {
            connector: self.clone(),
            session: Mutex::new(Some(session)),
        })
    }
}

#[derive(Debug)]
pub struct Smb2 {
    connector: Connector,
    session: Mutex<Option<Session>>,
}

/// Runs `$op` on the session of `$smb`, reconnecting first if needed and
/// dropping the session if the operation broke it.
macro_rules! with_session {
    ($smb:expr, $s:ident => $op:expr) => {{
        let mut guard = $smb.lock().await?;
        let res = match guard.as_mut() {
            Some($s) => $op.await,
            None => Err(Error::Disconnected("no session".into())),
        };
        settle(&mut guard, res)
    }};
}

impl Smb2 {
    async fn lock(&self) -> fdeploy::Result<MutexGuard<'_, Option<Session>>> {
        let mut guard = self.session.lock().await;
        if guard.is_none() {
            log::info!("reconnecting to {}", self.connector.server);
            // the server answered before, a failed probe is a lost connection
            let session = self.connector.open().await.map_err(|err| match err {
                Error::Unreachable(msg) => Error::Disconnected(msg),
                err => err,
            })?;
            *guard = Some(session);
        }
        Ok(guard)
    }
}

fn drops_session(err: &Error) -> bool {
    matches!(
        err,
        Error::Disconnected(..) | Error::Timeout(..) | Error::Io(..)
    )
}

fn settle<T>(slot: &mut Option<Session>, res: fdeploy::Result<T>) -> fdeploy::Result<T> {
    if let Err(err) = &res {
        if drops_session(err) && slot.take().is_some() {
            log::debug!("dropping SMB session after: {err}");
        }
    }
    res
}

impl super::Stat for Smb2 {
    async fn stat(&self, path: &Path) -> fdeploy::Result<Option<Entry>> {
        with_session!(self, s => s.stat(path))
    }
}

impl super::DirEntries for Smb2 {
    fn dir_entries(
        &self,
        parent_path: &Path,
    ) -> impl Stream<Item = fdeploy::Result<Entry>> + Send {
        try_stream! {
            let entries = async { with_session!(self, s => s.list(parent_path)) }.await?;
            for entry in entries {
                yield entry;
            }
        }
    }
}

impl super::MkDir for Smb2 {
    async fn mkdir(&self, path: &Path, parents: bool) -> fdeploy::Result<()> {
        with_session!(self, s => s.mkdir(path, parents))
    }
}

impl super::WriteFile for Smb2 {
    async fn write_file(&self, path: &Path, data: impl AsyncRead + Send) -> fdeploy::Result<u64> {
        with_session!(self, s => s.write_file(path, data))
    }
}

impl super::SetMtime for Smb2 {
    async fn set_mtime(&self, path: &Path, mtime: i64) -> fdeploy::Result<()> {
        with_session!(self, s => s.set_mtime(path, mtime))
    }
}

impl super::Delete for Smb2 {
    async fn delete(&self, path: &Path, kind: EntryKind) -> fdeploy::Result<()> {
        with_session!(self, s => s.delete(path, kind))
    }
}

impl Shutdown for Smb2 {
    async fn shutdown(&self) -> fdeploy::Result<()> {
        let Some(mut session) = self.session.lock().await.take() else {
            return Ok(());
        };
        session.conn.tree_disconnect(session.tree_id).await?;
        session.conn.logoff().await?;
        log::debug!("logged off {}", self.connector.server);
        Ok(())
    }
}

impl super::Storage for Smb2 {}

#[derive(Debug)]
struct Session {
    conn: Connection,
    tree_id: u32,
}

impl Session {
    async fn open(&mut self, req: &CreateRequest<'_>) -> fdeploy::Result<CreateResponse> {
        log::trace!("CREATE {} disposition {}", req.name, req.disposition);
        self.conn.create(self.tree_id, req).await
    }

    /// Closes `file_id` whatever the outcome of the operation done with it.
    async fn finish<T>(&mut self, file_id: FileId, res: fdeploy::Result<T>) -> fdeploy::Result<T> {
        let closed = self.conn.close(self.tree_id, file_id).await;
        let value = res?;
        closed?;
        Ok(value)
    }

    async fn stat(&mut self, path: &Path) -> fdeploy::Result<Option<Entry>> {
        let name = path.to_windows_string();
        let req = CreateRequest::new(&name, access::FILE_READ_ATTRIBUTES, disposition::OPEN, 0);
        let resp = match self.open(&req).await {
            Ok(resp) => resp,
            Err(Error::Protocol { status, .. }) => {
                log::trace!("{path} considered absent: {status}");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        let entry = entry_from_create(path, &resp);
        self.finish(resp.file_id, Ok(Some(entry))).await
    }

    async fn list(&mut self, parent: &Path) -> fdeploy::Result<Vec<Entry>> {
        let name = parent.to_windows_string();
        let req = CreateRequest::new(
            &name,
            access::FILE_READ_DATA | access::FILE_READ_ATTRIBUTES | access::SYNCHRONIZE,
            disposition::OPEN,
            options::DIRECTORY_FILE,
        );
        let file_id = self.open(&req).await?.file_id;

        let mut entries = Vec::new();
        let mut restart = true;
        let res = loop {
            match self.conn.query_directory(self.tree_id, file_id, restart).await {
                Ok(Some(batch)) => {
                    for e in batch {
                        if e.name == "." || e.name == ".." {
                            continue;
                        }
                        let (kind, size) = if e.is_dir() {
                            (EntryKind::Directory, 0)
                        } else {
                            (EntryKind::File, e.end_of_file)
                        };
                        entries.push(Entry::new(
                            parent.join(&e.name),
                            kind,
                            proto::unix_time(e.creation_time),
                            proto::unix_time(e.last_write_time),
                            size,
                        ));
                    }
                    restart = false;
                }
                Ok(None) => break Ok(entries),
                Err(err) => break Err(err),
            }
        };
        self.finish(file_id, res).await
    }

    async fn mkdir(&mut self, path: &Path, parents: bool) -> fdeploy::Result<()> {
        let segments: Vec<&str> = path.segments().collect();
        let first = if parents { 1 } else { segments.len() };
        for depth in first..=segments.len() {
            if depth == 0 {
                continue;
            }
            let name = segments[..depth].join("\\");
            let req = CreateRequest::new(
                &name,
                access::FILE_READ_ATTRIBUTES,
                disposition::OPEN_IF,
                options::DIRECTORY_FILE,
            );
            match self.open(&req).await {
                Ok(resp) => self.finish(resp.file_id, Ok(())).await?,
                Err(err) if err.status() == Some(status::OBJECT_NAME_COLLISION) => (),
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn write_file(&mut self, path: &Path, data: impl AsyncRead + Send) -> fdeploy::Result<u64> {
        let name = path.to_windows_string();
        let req = CreateRequest::new(
            &name,
            access::GENERIC_WRITE | access::FILE_READ_ATTRIBUTES,
            disposition::OVERWRITE_IF,
            options::NON_DIRECTORY_FILE,
        );
        let file_id = self.open(&req).await?.file_id;

        tokio::pin!(data);
        let mut buf = Vec::new();
        let mut offset = 0u64;
        let res = loop {
            buf.resize(self.conn.chunk_size(), 0);
            let len = match read_full(&mut data, &mut buf).await {
                Ok(0) => break Ok(offset),
                Ok(len) => len,
                Err(err) => break Err(local_error!("reading source of {path}: {err}")),
            };
            match self.conn.write(self.tree_id, file_id, offset, &buf[..len]).await {
                Ok(written) if written as usize == len => offset += len as u64,
                Ok(written) => {
                    break Err(Error::Io(format!(
                        "short write on {path} at offset {offset}: {written} of {len} bytes"
                    )))
                }
                Err(err) => break Err(err),
            }
            log::trace!("{path}: {offset} bytes written");
        };
        self.finish(file_id, res).await
    }

    async fn set_mtime(&mut self, path: &Path, mtime: i64) -> fdeploy::Result<()> {
        let name = path.to_windows_string();
        let req = CreateRequest::new(
            &name,
            access::FILE_WRITE_ATTRIBUTES | access::SYNCHRONIZE,
            disposition::OPEN,
            0,
        );
        let file_id = self.open(&req).await?.file_id;
        let res = self
            .conn
            .set_info(
                self.tree_id,
                proto::set_last_write_time(file_id, proto::filetime(mtime)),
            )
            .await;
        self.finish(file_id, res).await
    }

    async fn delete(&mut self, path: &Path, kind: EntryKind) -> fdeploy::Result<()> {
        let name = path.to_windows_string();
        let opts = match kind {
            EntryKind::File => options::NON_DIRECTORY_FILE,
            EntryKind::Directory => options::DIRECTORY_FILE,
        };
        let req = CreateRequest::new(&name, access::DELETE, disposition::OPEN, opts);
        let file_id = match self.open(&req).await {
            Ok(resp) => resp.file_id,
            Err(err) if err.status().is_some_and(status::is_not_found) => return Ok(()),
            Err(err) => return Err(err),
        };
        let res = self
            .conn
            .set_info(self.tree_id, proto::set_delete_pending(file_id))
            .await;
        self.finish(file_id, res).await
    }
}

fn entry_from_create(path: &Path, resp: &CreateResponse) -> Entry {
    let (kind, size) = if resp.is_dir() {
        (EntryKind::Directory, 0)
    } else {
        (EntryKind::File, resp.end_of_file)
    };
    Entry::new(
        path.to_path_buf(),
        kind,
        proto::unix_time(resp.creation_time),
        proto::unix_time(resp.last_write_time),
        size,
    )
}

/// Fills `buf` as much as the reader allows, returns 0 at end of data.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use fdeploy::NtStatus;

    use super::*;
    use crate::storage::Connect;

    #[test]
    fn transport_errors_drop_the_session() {
        assert!(drops_session(&Error::Disconnected("reset".into())));
        assert!(drops_session(&Error::Timeout("15s".into())));
        assert!(drops_session(&Error::Io("truncated".into())));
        assert!(!drops_session(&fdeploy::protocol_error!(
            NtStatus(0xC000_0022),
            "open"
        )));
        assert!(!drops_session(&Error::Local("missing".into())));
    }

    #[tokio::test]
    async fn refused_connection_is_unreachable() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = ServerConnection {
            server_address: "127.0.0.1".into(),
            port,
            share_name: "wwwroot".into(),
            connect_timeout_ms: 500,
            ..ServerConnection::default()
        };
        let err = Connector::new(&config).connect().await.unwrap_err();
        assert!(matches!(err, Error::Unreachable(..)), "{err:?}");
        assert!(err.is_connectivity());
    }

    #[tokio::test]
    async fn read_full_spans_short_reads() {
        let data = [1u8; 10];
        let mut reader = tokio::io::AsyncReadExt::chain(&data[..4], &data[4..]);
        let mut buf = [0u8; 8];
        assert_eq!(read_full(&mut reader, &mut buf).await.unwrap(), 8);
        assert_eq!(read_full(&mut reader, &mut buf).await.unwrap(), 2);
        assert_eq!(read_full(&mut reader, &mut buf).await.unwrap(), 0);
    }
}
