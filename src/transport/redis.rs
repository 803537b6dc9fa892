//! Purpose: Network connection to the remote store over RESP2 (TCP, optional TLS).
//! Exports: `RedisConnector`, `RedisConnection`, `RedisSubscription`.
//! Role: Concrete `Connector` used by the client outside of tests.
//! Invariants: One request is written and its reply fully read before the next request.
//! Invariants: A clean EOF mid-request is an `Io` fault; error replies are `Protocol` faults.
use super::{Connector, Endpoint, StoreConnection, Subscription, tls};
use crate::core::error::{ClientResult, Error, ErrorKind};
use crate::core::resp::{self, RespValue};
use bytes::{Buf, BytesMut};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

const READ_CHUNK: usize = 16 * 1024;

trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncIo for T {}

#[derive(Clone, Debug, Default)]
pub struct RedisConnector;

impl RedisConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for RedisConnector {
    type Conn = RedisConnection;

    async fn connect(&self, endpoint: &Endpoint) -> ClientResult<RedisConnection> {
        let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message(format!("failed to connect to {endpoint}"))
                    .with_source(err)
            })?;
        let _ = tcp.set_nodelay(true);

        let io: Box<dyn AsyncIo> = if endpoint.tls {
            let connector = TlsConnector::from(tls::client_config()?);
            let server_name = ServerName::try_from(endpoint.host.clone()).map_err(|err| {
                Error::new(ErrorKind::Configuration)
                    .with_message(format!("invalid TLS server name {}", endpoint.host))
                    .with_source(err)
            })?;
            let stream = connector.connect(server_name, tcp).await.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message(format!("TLS handshake with {endpoint} failed"))
                    .with_source(err)
            })?;
            Box::new(stream)
        } else {
            Box::new(tcp)
        };

        debug!(%endpoint, "connected");
        Ok(RedisConnection::new(io))
    }
}

pub struct RedisConnection {
    io: Box<dyn AsyncIo>,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl RedisConnection {
    fn new(io: Box<dyn AsyncIo>) -> Self {
        Self {
            io,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
        }
    }

    async fn command(&mut self, args: &[&[u8]]) -> ClientResult<RespValue> {
        self.send(args).await?;
        match self.read_reply().await? {
            RespValue::Error(message) => Err(Error::new(ErrorKind::Protocol).with_message(message)),
            reply => Ok(reply),
        }
    }

    async fn send(&mut self, args: &[&[u8]]) -> ClientResult<()> {
        self.write_buf.clear();
        resp::encode_command(args, &mut self.write_buf);
        self.io.write_all(&self.write_buf).await.map_err(write_error)?;
        self.io.flush().await.map_err(write_error)
    }

    async fn read_reply(&mut self) -> ClientResult<RespValue> {
        self.read_frame()
            .await?
            .ok_or_else(|| Error::new(ErrorKind::Io).with_message("connection closed by server"))
    }

    /// Next complete frame, or `None` on a clean EOF between frames.
    async fn read_frame(&mut self) -> ClientResult<Option<RespValue>> {
        loop {
            if let Some((value, used)) = resp::parse(&self.read_buf)? {
                self.read_buf.advance(used);
                return Ok(Some(value));
            }
            self.read_buf.reserve(READ_CHUNK);
            let read = self.io.read_buf(&mut self.read_buf).await.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to read reply")
                    .with_source(err)
            })?;
            if read == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(Error::new(ErrorKind::Io).with_message("connection closed mid-reply"));
            }
        }
    }

    async fn script_command(
        &mut self,
        verb: &str,
        script: &str,
        keys: &[&str],
        args: &[&str],
    ) -> ClientResult<RespValue> {
        let key_count = keys.len().to_string();
        let mut parts: Vec<&[u8]> = Vec::with_capacity(3 + keys.len() + args.len());
        parts.push(verb.as_bytes());
        parts.push(script.as_bytes());
        parts.push(key_count.as_bytes());
        parts.extend(keys.iter().map(|key| key.as_bytes()));
        parts.extend(args.iter().map(|arg| arg.as_bytes()));
        self.command(&parts).await
    }
}

impl StoreConnection for RedisConnection {
    type Subscription = RedisSubscription;

    async fn auth(&mut self, token: &str) -> ClientResult<()> {
        match self.command(&["AUTH".as_bytes(), token.as_bytes()]).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::Protocol => {
                let message = err.message().unwrap_or("authentication rejected").to_string();
                Err(Error::new(ErrorKind::Auth)
                    .with_message(message)
                    .with_hint("Check the project token; the client must be recreated."))
            }
            Err(err) => Err(err),
        }
    }

    async fn eval_sha(
        &mut self,
        digest: &str,
        keys: &[&str],
        args: &[&str],
    ) -> ClientResult<RespValue> {
        self.script_command("EVALSHA", digest, keys, args).await
    }

    async fn eval(&mut self, source: &str, keys: &[&str], args: &[&str]) -> ClientResult<RespValue> {
        self.script_command("EVAL", source, keys, args).await
    }

    async fn get(&mut self, key: &str) -> ClientResult<Option<String>> {
        let reply = self.command(&["GET".as_bytes(), key.as_bytes()]).await?;
        if reply.is_null() {
            return Ok(None);
        }
        reply.as_text().map(Some).ok_or_else(|| unexpected_reply("GET", &reply))
    }

    async fn del(&mut self, key: &str) -> ClientResult<i64> {
        match self.command(&["DEL".as_bytes(), key.as_bytes()]).await? {
            RespValue::Integer(count) => Ok(count),
            other => Err(unexpected_reply("DEL", &other)),
        }
    }

    async fn keys(&mut self, pattern: &str) -> ClientResult<Vec<String>> {
        match self.command(&["KEYS".as_bytes(), pattern.as_bytes()]).await? {
            RespValue::Array(items) => items
                .iter()
                .map(|item| item.as_text().ok_or_else(|| unexpected_reply("KEYS", item)))
                .collect(),
            RespValue::Null => Ok(Vec::new()),
            other => Err(unexpected_reply("KEYS", &other)),
        }
    }

    async fn subscribe(mut self, channel: &str) -> ClientResult<RedisSubscription> {
        let reply = self.command(&["SUBSCRIBE".as_bytes(), channel.as_bytes()]).await?;
        match &reply {
            RespValue::Array(items)
                if items.first().and_then(RespValue::as_text).as_deref() == Some("subscribe") => {}
            other => return Err(unexpected_reply("SUBSCRIBE", other)),
        }
        debug!(channel, "subscribed");
        Ok(RedisSubscription {
            conn: self,
            channel: channel.to_string(),
        })
    }

    async fn close(mut self) {
        let _ = self.send(&["QUIT".as_bytes()]).await;
        let _ = self.io.shutdown().await;
    }
}

pub struct RedisSubscription {
    conn: RedisConnection,
    channel: String,
}

impl Subscription for RedisSubscription {
    async fn next_message(&mut self) -> ClientResult<Option<String>> {
        loop {
            let items = match self.conn.read_frame().await? {
                None => return Ok(None),
                Some(RespValue::Array(items)) => items,
                Some(RespValue::Error(message)) => {
                    return Err(Error::new(ErrorKind::Protocol).with_message(message));
                }
                Some(_) => continue,
            };
            let kind = items.first().and_then(RespValue::as_text);
            if kind.as_deref() != Some("message") || items.len() != 3 {
                continue;
            }
            if items[1].as_text().as_deref() != Some(self.channel.as_str()) {
                continue;
            }
            return match items[2].as_text() {
                Some(payload) => Ok(Some(payload)),
                None => Err(unexpected_reply("message", &items[2])),
            };
        }
    }
}

fn write_error(err: std::io::Error) -> Error {
    Error::new(ErrorKind::Io)
        .with_message("failed to write request")
        .with_source(err)
}

fn unexpected_reply(command: &str, reply: &RespValue) -> Error {
    Error::new(ErrorKind::Protocol).with_message(format!("unexpected {command} reply: {reply:?}"))
}
