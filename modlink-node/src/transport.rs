//! TCP transport: host accepts participants, participant joins a host. Each connection
//! runs the module check before the session is admitted.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use modlink_core::wire::{decode_payload, encode_frame, payload_len, LEN_SIZE};
use modlink_core::{
    Message, NegotiationAction, Negotiator, RejectReason, Verdict, PROTOCOL_VERSION,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::diagnostic;

pub type SharedNegotiator = Arc<Mutex<Negotiator>>;

/// Outcome of joining a host.
#[derive(Debug)]
pub enum Joined {
    /// Admitted; the session lives as long as the stream.
    Accepted(TcpStream),
    Rejected(RejectReason),
}

/// Verdict plus the rendered report sent along with a rejection.
struct Decision {
    verdict: Verdict,
    report: Option<String>,
}

impl Decision {
    fn to_message(&self) -> Message {
        match self.verdict {
            Verdict::Accepted => Message::Verdict {
                accepted: true,
                reason: None,
                report: None,
            },
            Verdict::Rejected(reason) => Message::Verdict {
                accepted: false,
                reason: Some(reason),
                report: self.report.clone(),
            },
        }
    }
}

/// Accept participants until the listener fails.
pub async fn serve(
    listener: TcpListener,
    negotiator: SharedNegotiator,
    handshake_timeout: Duration,
) -> io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let negotiator = negotiator.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_participant(stream, peer, &negotiator, handshake_timeout).await {
                tracing::debug!(peer = %peer, error = %e, "connection ended with error");
            }
            negotiator.lock().await.on_disconnected(peer);
        });
    }
}

async fn serve_participant(
    stream: TcpStream,
    peer: SocketAddr,
    negotiator: &SharedNegotiator,
    handshake_timeout: Duration,
) -> anyhow::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let actions = negotiator.lock().await.on_connection_started(peer);
    apply(actions, &mut writer).await?;

    let hello = tokio::time::timeout(
        handshake_timeout,
        await_hello(&mut reader, &mut writer, peer, negotiator),
    )
    .await;
    match hello {
        Ok(Ok(true)) => {}
        Ok(Ok(false)) => {
            tracing::debug!(peer = %peer, "closed before handshake");
            return Ok(());
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => tracing::warn!(peer = %peer, "no handshake before timeout; deciding without it"),
    }

    let actions = negotiator.lock().await.on_handshake(peer)?;
    let decision = apply(actions, &mut writer)
        .await?
        .context("handshake produced no verdict")?;
    write_message(&mut writer, &decision.to_message()).await?;
    if let Verdict::Rejected(_) = decision.verdict {
        return Ok(());
    }

    tracing::info!(peer = %peer, "participant joined");
    while let Some(msg) = read_message(&mut reader).await? {
        tracing::trace!(peer = %peer, kind = message_kind(&msg), "session message");
    }
    tracing::info!(peer = %peer, "participant left");
    Ok(())
}

/// Read until the participant's `Hello`. Returns false if the stream closed first.
async fn await_hello<R, W>(
    reader: &mut R,
    writer: &mut W,
    peer: SocketAddr,
    negotiator: &SharedNegotiator,
) -> anyhow::Result<bool>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = read_message(reader).await? {
        match msg {
            Message::ModuleInventory { payload } => {
                let result = negotiator.lock().await.on_message_received(peer, &payload);
                match result {
                    Ok(actions) => {
                        apply(actions, writer).await?;
                    }
                    Err(e) => tracing::warn!(peer = %peer, error = %e, "ignoring module inventory"),
                }
            }
            Message::Hello {
                protocol_version,
                name,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    anyhow::bail!(
                        "participant speaks protocol {}, expected {}",
                        protocol_version,
                        PROTOCOL_VERSION
                    );
                }
                tracing::debug!(peer = %peer, %name, "handshake");
                return Ok(true);
            }
            Message::Verdict { .. } => {
                tracing::warn!(peer = %peer, "participant sent a verdict; ignoring");
            }
        }
    }
    Ok(false)
}

/// Connect to the host at `addr` and run the module check. On rejection the connection
/// is already closed and forgotten.
pub async fn join(
    negotiator: &SharedNegotiator,
    addr: SocketAddr,
    name: &str,
    handshake_timeout: Duration,
) -> anyhow::Result<Joined> {
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to {addr}"))?;
    let peer = stream.peer_addr()?;
    let verdict = tokio::time::timeout(
        handshake_timeout,
        negotiate_with_host(&mut stream, peer, negotiator, name),
    )
    .await
    .map_err(|_| anyhow::anyhow!("handshake with {peer} timed out"))
    .and_then(|r| r);

    match verdict {
        Ok(Verdict::Accepted) => {
            tracing::info!(host = %peer, "joined");
            Ok(Joined::Accepted(stream))
        }
        Ok(Verdict::Rejected(reason)) => {
            negotiator.lock().await.on_disconnected(peer);
            Ok(Joined::Rejected(reason))
        }
        Err(e) => {
            negotiator.lock().await.on_disconnected(peer);
            Err(e)
        }
    }
}

async fn negotiate_with_host(
    stream: &mut TcpStream,
    peer: SocketAddr,
    negotiator: &SharedNegotiator,
    name: &str,
) -> anyhow::Result<Verdict> {
    let (mut reader, mut writer) = stream.split();
    let actions = negotiator.lock().await.on_connection_started(peer);
    apply(actions, &mut writer).await?;
    let hello = Message::Hello {
        protocol_version: PROTOCOL_VERSION,
        name: name.to_string(),
    };
    write_message(&mut writer, &hello).await?;

    let mut local: Option<Decision> = None;
    loop {
        let Some(msg) = read_message(&mut reader).await? else {
            anyhow::bail!("host closed the connection during the handshake");
        };
        match msg {
            Message::ModuleInventory { payload } => {
                let actions = negotiator.lock().await.on_message_received(peer, &payload)?;
                local = apply(actions, &mut writer).await?;
            }
            Message::Hello { .. } => {}
            Message::Verdict {
                accepted,
                reason,
                report,
            } => {
                if local.is_none() {
                    let actions = negotiator.lock().await.on_handshake(peer)?;
                    local = apply(actions, &mut writer).await?;
                }
                if !accepted {
                    let reason = reason.unwrap_or(RejectReason::IncompatibleModules);
                    tracing::error!(
                        host = %peer,
                        ?reason,
                        "host rejected the connection\n{}",
                        report.as_deref().unwrap_or_default()
                    );
                    return Ok(Verdict::Rejected(reason));
                }
                return Ok(local.map_or(Verdict::Accepted, |d| d.verdict));
            }
        }
    }
}

/// Stay in an admitted session until the host closes it.
pub async fn stay_connected(
    negotiator: &SharedNegotiator,
    stream: TcpStream,
) -> anyhow::Result<()> {
    let peer = stream.peer_addr()?;
    let (mut reader, _writer) = stream.into_split();
    let result = async {
        while let Some(msg) = read_message(&mut reader).await? {
            tracing::trace!(host = %peer, kind = message_kind(&msg), "session message");
        }
        anyhow::Ok(())
    }
    .await;
    tracing::info!(host = %peer, "session closed");
    negotiator.lock().await.on_disconnected(peer);
    result
}

/// Perform negotiation actions on this connection. Returns the verdict, if one was reached.
async fn apply<W: AsyncWrite + Unpin>(
    actions: Vec<NegotiationAction>,
    writer: &mut W,
) -> io::Result<Option<Decision>> {
    let mut decision = None;
    for action in actions {
        match action {
            NegotiationAction::Send(_, payload) => {
                write_message(writer, &Message::ModuleInventory { payload }).await?;
            }
            NegotiationAction::Accept(_) => {
                decision = Some(Decision {
                    verdict: Verdict::Accepted,
                    report: None,
                });
            }
            NegotiationAction::Reject { reason, report, .. } => {
                decision = Some(Decision {
                    verdict: Verdict::Rejected(reason),
                    report: Some(report.render()),
                });
            }
            NegotiationAction::PresentReport(d) => diagnostic::present(&d),
        }
    }
    Ok(decision)
}

/// Read one frame. `None` on a clean close at a frame boundary.
async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Message>> {
    let mut len_buf = [0u8; LEN_SIZE];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = payload_len(len_buf).map_err(invalid_data)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    decode_payload(&payload).map(Some).map_err(invalid_data)
}

async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> io::Result<()> {
    let frame = encode_frame(msg).map_err(invalid_data)?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

fn invalid_data<E>(e: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, e)
}

fn message_kind(msg: &Message) -> &'static str {
    match msg {
        Message::ModuleInventory { .. } => "module-inventory",
        Message::Hello { .. } => "hello",
        Message::Verdict { .. } => "verdict",
    }
}
