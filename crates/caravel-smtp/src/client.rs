use crate::client_types::{Response, SmtpClientTimeouts};
use memchr::memmem::Finder;
use std::net::{IpAddr, SocketAddr};
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpSocket;
use tokio::time::timeout;

const MAX_LINE_LEN: usize = 4096;

pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + std::fmt::Debug + Unpin + Send + Sync {}
impl<T: AsyncRead + AsyncWrite + std::fmt::Debug + Unpin + Send + Sync> AsyncReadAndWrite for T {}

pub type BoxedAsyncReadAndWrite = Box<dyn AsyncReadAndWrite>;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("response is not UTF8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("Malformed Response: {0}")]
    MalformedResponseLine(String),
    #[error("Response line is too long")]
    ResponseTooLong,
    #[error("Not connected")]
    NotConnected,
    #[error("Command rejected {0:?}")]
    Rejected(Response),
    #[error("Timed Out waiting {duration:?} for response to {command:?}")]
    TimeOutResponse {
        command: Option<String>,
        duration: Duration,
    },
    #[error("Timed Out writing {command:?} after {duration:?}")]
    TimeOutRequest { command: String, duration: Duration },
    #[error("Error {error} reading response to {command:?}")]
    ReadError {
        command: Option<String>,
        error: String,
    },
    #[error("Error {error} writing {command:?}")]
    WriteError { command: String, error: String },
    #[error("Timed Out sending message payload data")]
    TimeOutData,
    #[error("failed to create socket for {address}: {error}")]
    SocketSetup { address: String, error: String },
    #[error("failed to bind source address {address}: {error}")]
    BindFailed { address: IpAddr, error: String },
    #[error("failed to connect to {address}: {error}")]
    ConnectFailed { address: String, error: String },
    #[error("Timed Out connecting to {address}")]
    TimeOutConnect { address: String },
}

impl ClientError {
    /// True when the error happened before any packet reached the peer:
    /// a locally misconfigured socket rather than a connectivity problem.
    pub fn is_local_setup(&self) -> bool {
        matches!(
            self,
            Self::SocketSetup { .. } | Self::BindFailed { .. }
        )
    }
}

/// The terminal signal returned by a step's `failed` callback.
/// `Abort` ends the transaction without attempting later steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepFlow {
    Continue,
    Abort,
}

#[derive(Debug)]
pub struct SmtpClient {
    socket: Option<BoxedAsyncReadAndWrite>,
    hostname: String,
    read_buffer: Vec<u8>,
    timeouts: SmtpClientTimeouts,
    greeted: bool,
}

impl SmtpClient {
    /// Bind `source` (if any), connect to `addr` and read the 220 banner.
    /// A non-220 banner surfaces as `ClientError::Rejected`.
    pub async fn connect(
        addr: SocketAddr,
        source: Option<IpAddr>,
        hostname: &str,
        timeouts: SmtpClientTimeouts,
    ) -> Result<Self, ClientError> {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(|err| ClientError::SocketSetup {
            address: addr.to_string(),
            error: err.to_string(),
        })?;

        if let Some(source) = source {
            socket
                .bind(SocketAddr::new(source, 0))
                .map_err(|err| ClientError::BindFailed {
                    address: source,
                    error: err.to_string(),
                })?;
        }

        let stream = timeout(timeouts.connect_timeout, socket.connect(addr))
            .await
            .map_err(|_| ClientError::TimeOutConnect {
                address: addr.to_string(),
            })?
            .map_err(|err| ClientError::ConnectFailed {
                address: addr.to_string(),
                error: err.to_string(),
            })?;

        let mut client = Self::with_stream(stream, hostname, timeouts);

        let banner = client.read_response(None, timeouts.banner_timeout).await?;
        if banner.code != 220 {
            return Err(ClientError::Rejected(banner));
        }

        Ok(client)
    }

    pub fn with_stream<S: AsyncReadAndWrite + 'static, H: AsRef<str>>(
        stream: S,
        hostname: H,
        timeouts: SmtpClientTimeouts,
    ) -> Self {
        Self {
            socket: Some(Box::new(stream)),
            hostname: hostname.as_ref().to_string(),
            read_buffer: Vec::with_capacity(1024),
            timeouts,
            greeted: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    pub fn timeouts(&self) -> &SmtpClientTimeouts {
        &self.timeouts
    }

    async fn read_line(
        &mut self,
        timeout_duration: Duration,
        cmd: Option<&str>,
    ) -> Result<String, ClientError> {
        let mut too_long = false;
        loop {
            let mut iter = self.read_buffer.iter().enumerate();
            while let Some((i, &b)) = iter.next() {
                if b != b'\r' {
                    continue;
                }
                if let Some((_, b'\n')) = iter.next() {
                    if too_long {
                        self.read_buffer.drain(0..i + 2);
                        return Err(ClientError::ResponseTooLong);
                    }
                    let line = String::from_utf8(self.read_buffer[0..i].to_vec());
                    self.read_buffer.drain(0..i + 2);
                    return Ok(line?);
                }
            }
            if self.read_buffer.len() > MAX_LINE_LEN {
                self.read_buffer.clear();
                too_long = true;
            }

            // Didn't find a complete line; pull more from the peer
            let mut data = [0u8; MAX_LINE_LEN];
            let size = match self.socket.as_mut() {
                Some(s) => match timeout(timeout_duration, s.read(&mut data)).await {
                    Ok(Ok(size)) => size,
                    Ok(Err(err)) => {
                        self.socket.take();
                        return Err(ClientError::ReadError {
                            command: cmd.map(|s| s.to_string()),
                            error: err.to_string(),
                        });
                    }
                    Err(_) => {
                        self.socket.take();
                        return Err(ClientError::TimeOutResponse {
                            command: cmd.map(|s| s.to_string()),
                            duration: timeout_duration,
                        });
                    }
                },
                None => return Err(ClientError::NotConnected),
            };
            if size == 0 {
                self.socket.take();
                return Err(ClientError::ReadError {
                    command: cmd.map(|s| s.to_string()),
                    error: "Connection closed by peer".to_string(),
                });
            }
            self.read_buffer.extend_from_slice(&data[0..size]);
        }
    }

    pub async fn read_response(
        &mut self,
        command: Option<&str>,
        timeout_duration: Duration,
    ) -> Result<Response, ClientError> {
        if let Some(sock) = self.socket.as_mut() {
            if let Err(err) = sock.flush().await {
                self.socket.take();
                return Err(ClientError::WriteError {
                    command: command.unwrap_or("").to_string(),
                    error: format!("flush: {err}"),
                });
            }
        }

        let line = self.read_line(timeout_duration, command).await?;
        tracing::trace!("recv<-{}: {line}", self.hostname);

        let parsed = parse_response_line(&line)?;
        let code = parsed.code;
        let mut is_final = parsed.is_final;
        let mut content = parsed.content.to_string();

        let subsequent_timeout = Duration::from_secs(60).min(timeout_duration);
        while !is_final {
            let line = self.read_line(subsequent_timeout, command).await?;
            let parsed = parse_response_line(&line)?;
            if parsed.code != code {
                return Err(ClientError::MalformedResponseLine(line));
            }
            content.push('\n');
            content.push_str(parsed.content);
            is_final = parsed.is_final;
        }

        Ok(Response {
            code,
            content,
            command: command.map(|s| s.to_string()),
        })
    }

    async fn write_command(
        &mut self,
        line: &str,
        timeout_duration: Duration,
    ) -> Result<(), ClientError> {
        let socket = self.socket.as_mut().ok_or(ClientError::NotConnected)?;
        tracing::trace!("send->{}: {line}", self.hostname);
        match timeout(
            timeout_duration,
            socket.write_all(format!("{line}\r\n").as_bytes()),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.socket.take();
                Err(ClientError::WriteError {
                    command: line.to_string(),
                    error: err.to_string(),
                })
            }
            Err(_) => {
                self.socket.take();
                Err(ClientError::TimeOutRequest {
                    command: line.to_string(),
                    duration: timeout_duration,
                })
            }
        }
    }

    pub async fn send_command(
        &mut self,
        command: &str,
        timeout_duration: Duration,
    ) -> Result<Response, ClientError> {
        self.write_command(command, timeout_duration).await?;
        self.read_response(Some(command), timeout_duration).await
    }

    async fn write_data(&mut self, data: &[u8]) -> Result<(), ClientError> {
        let socket = self.socket.as_mut().ok_or(ClientError::NotConnected)?;
        match timeout(self.timeouts.data_timeout, socket.write_all(data)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.socket.take();
                Err(ClientError::WriteError {
                    command: "message payload".to_string(),
                    error: err.to_string(),
                })
            }
            Err(_) => {
                self.socket.take();
                Err(ClientError::TimeOutData)
            }
        }
    }

    /// First transaction on a connection greets with HELO; subsequent
    /// transactions reset prior state with RSET instead.
    pub async fn exec_helo_or_rset<F>(
        &mut self,
        helo_name: &str,
        failed: F,
    ) -> Result<StepFlow, ClientError>
    where
        F: FnOnce(&Response) -> StepFlow,
    {
        let response = if self.greeted {
            self.send_command("RSET", self.timeouts.rset_timeout).await?
        } else {
            self.send_command(&format!("HELO {helo_name}"), self.timeouts.helo_timeout)
                .await?
        };
        if response.code == 250 {
            self.greeted = true;
            Ok(StepFlow::Continue)
        } else {
            Ok(failed(&response))
        }
    }

    pub async fn exec_mail_from<F>(
        &mut self,
        sender: &str,
        failed: F,
    ) -> Result<StepFlow, ClientError>
    where
        F: FnOnce(&Response) -> StepFlow,
    {
        let response = self
            .send_command(
                &format!("MAIL FROM:<{sender}>"),
                self.timeouts.mail_from_timeout,
            )
            .await?;
        if response.code == 250 {
            Ok(StepFlow::Continue)
        } else {
            Ok(failed(&response))
        }
    }

    pub async fn exec_rcpt_to<F>(
        &mut self,
        recipient: &str,
        failed: F,
    ) -> Result<StepFlow, ClientError>
    where
        F: FnOnce(&Response) -> StepFlow,
    {
        let response = self
            .send_command(
                &format!("RCPT TO:<{recipient}>"),
                self.timeouts.rcpt_to_timeout,
            )
            .await?;
        if response.code == 250 || response.code == 251 {
            Ok(StepFlow::Continue)
        } else {
            Ok(failed(&response))
        }
    }

    pub async fn exec_data<F>(&mut self, data: &[u8], failed: F) -> Result<StepFlow, ClientError>
    where
        F: FnOnce(&Response) -> StepFlow,
    {
        let response = self.send_command("DATA", self.timeouts.data_timeout).await?;
        if response.code != 354 {
            return Ok(failed(&response));
        }

        let stuffed;
        let data = match apply_dot_stuffing(data) {
            Some(d) => {
                stuffed = d;
                &stuffed
            }
            None => data,
        };
        self.write_data(data).await?;
        if !data.ends_with(b"\r\n") {
            self.write_data(b"\r\n").await?;
        }
        self.write_data(b".\r\n").await?;

        let response = self
            .read_response(Some("DATA"), self.timeouts.data_dot_timeout)
            .await?;
        if response.code == 250 {
            Ok(StepFlow::Continue)
        } else {
            Ok(failed(&response))
        }
    }

    pub async fn quit(&mut self) -> Result<Response, ClientError> {
        self.send_command("QUIT", self.timeouts.rset_timeout).await
    }
}

struct ResponseLine<'a> {
    code: u16,
    is_final: bool,
    content: &'a str,
}

fn parse_response_line(line: &str) -> Result<ResponseLine, ClientError> {
    if line.len() < 4 {
        return Err(ClientError::MalformedResponseLine(line.to_string()));
    }

    match line.as_bytes()[3] {
        b' ' | b'-' => match line[0..3].parse::<u16>() {
            Ok(code) => Ok(ResponseLine {
                code,
                is_final: line.as_bytes()[3] == b' ',
                content: &line[4..],
            }),
            Err(_) => Err(ClientError::MalformedResponseLine(line.to_string())),
        },
        _ => Err(ClientError::MalformedResponseLine(line.to_string())),
    }
}

fn apply_dot_stuffing(data: &[u8]) -> Option<Vec<u8>> {
    static LFDOT: LazyLock<Finder> = LazyLock::new(|| Finder::new("\n."));

    if !data.starts_with(b".") && LFDOT.find(data).is_none() {
        return None;
    }

    let mut stuffed = Vec::with_capacity(data.len() + 16);
    if data.starts_with(b".") {
        stuffed.push(b'.');
    }
    let mut last_idx = 0;
    for i in LFDOT.find_iter(data) {
        stuffed.extend_from_slice(&data[last_idx..=i]);
        stuffed.push(b'.');
        last_idx = i + 1;
    }
    stuffed.extend_from_slice(&data[last_idx..]);
    Some(stuffed)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dot_stuffing() {
        assert_eq!(apply_dot_stuffing(b"foo"), None);
        assert_eq!(apply_dot_stuffing(b".foo").unwrap(), b"..foo");
        assert_eq!(apply_dot_stuffing(b"foo\r\n.bar").unwrap(), b"foo\r\n..bar");
        assert_eq!(
            apply_dot_stuffing(b"foo\r\n.bar\r\n..baz\r\n").unwrap(),
            b"foo\r\n..bar\r\n...baz\r\n"
        );
    }

    #[test]
    fn response_line_parsing() {
        let line = parse_response_line("250-mx.example.com at your service").unwrap();
        assert_eq!(line.code, 250);
        assert!(!line.is_final);
        assert_eq!(line.content, "mx.example.com at your service");

        let line = parse_response_line("250 ok").unwrap();
        assert!(line.is_final);

        assert!(matches!(
            parse_response_line("2"),
            Err(ClientError::MalformedResponseLine(_))
        ));
        assert!(matches!(
            parse_response_line("nope nope"),
            Err(ClientError::MalformedResponseLine(_))
        ));
    }

    async fn client_with_canned(input: &str) -> SmtpClient {
        let (client_io, mut server_io) = tokio::io::duplex(64 * 1024);
        let input = input.to_string();
        tokio::spawn(async move {
            server_io.write_all(input.as_bytes()).await.ok();
            // Swallow whatever the client writes so writes don't stall
            let mut buf = [0u8; 4096];
            while let Ok(n) = server_io.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        });
        SmtpClient::with_stream(client_io, "mx.example.com", SmtpClientTimeouts::short_timeouts())
    }

    #[tokio::test]
    async fn multi_line_response_assembly() {
        let mut client =
            client_with_canned("250-mx.example.com\r\n250-PIPELINING\r\n250 SIZE 10485760\r\n")
                .await;
        let response = client
            .read_response(Some("EHLO"), Duration::from_secs(5))
            .await
            .unwrap();
        k9::assert_equal!(response.code, 250);
        k9::assert_equal!(
            response.content,
            "mx.example.com\nPIPELINING\nSIZE 10485760"
        );
    }

    #[tokio::test]
    async fn first_transaction_greets_then_resets() {
        let mut client = client_with_canned("250 hello\r\n250 reset ok\r\n").await;

        let flow = client
            .exec_helo_or_rset("sender.example.com", |_| StepFlow::Abort)
            .await
            .unwrap();
        k9::assert_equal!(flow, StepFlow::Continue);

        // Second invocation must use RSET and still succeed
        let flow = client
            .exec_helo_or_rset("sender.example.com", |_| StepFlow::Abort)
            .await
            .unwrap();
        k9::assert_equal!(flow, StepFlow::Continue);
    }

    #[tokio::test]
    async fn failed_callback_sees_verbatim_response() {
        let mut client = client_with_canned("452 4.2.2 mailbox full\r\n").await;

        let mut seen = None;
        let flow = client
            .exec_mail_from("who@example.com", |response| {
                seen = Some(response.to_single_line());
                StepFlow::Abort
            })
            .await
            .unwrap();
        k9::assert_equal!(flow, StepFlow::Abort);
        k9::assert_equal!(seen.unwrap(), "452 4.2.2 mailbox full");
    }

    #[tokio::test]
    async fn closed_peer_is_a_transport_error() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        drop(server_io);
        let mut client = SmtpClient::with_stream(
            client_io,
            "mx.example.com",
            SmtpClientTimeouts::short_timeouts(),
        );
        let err = client
            .exec_mail_from("who@example.com", |_| StepFlow::Abort)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::WriteError { .. } | ClientError::ReadError { .. }));
        assert!(!client.is_connected());
    }
}
