//! Exec sub-resource over websocket (`v4.channel.k8s.io`).
//!
//! Every binary message starts with a channel byte: 1 is stdout, 2 is
//! stderr, 3 carries the final `Status` object with the exit code.

use futures::StreamExt;
use http::HeaderValue;
use http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use kiln_core::ports::{ExecFrame, ExecStream};
use kiln_core::sandbox::SandboxRef;
use kiln_core::{Error, Result};
use serde::Deserialize;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;
use url::Url;

pub const EXEC_PROTOCOL: &str = "v4.channel.k8s.io";

const STDOUT_CHANNEL: u8 = 1;
const STDERR_CHANNEL: u8 = 2;
const STATUS_CHANNEL: u8 = 3;

/// Websocket URL of the exec sub-resource for one command.
pub fn exec_url(base: &Url, sandbox: &SandboxRef, unit: &str, argv: &[String]) -> Result<Url> {
    let mut url = base
        .join(&format!(
            "api/v1/namespaces/{}/pods/{}/exec",
            sandbox.namespace, sandbox.name
        ))
        .map_err(|e| Error::Config(format!("invalid exec URL: {}", e)))?;
    let scheme = if base.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme)
        .map_err(|_| Error::Config(format!("cannot use {} for exec", base)))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("container", unit);
        for arg in argv {
            query.append_pair("command", arg);
        }
        query.append_pair("stdin", "false");
        query.append_pair("stdout", "true");
        query.append_pair("stderr", "true");
        query.append_pair("tty", "false");
    }
    Ok(url)
}

/// Open an exec session and adapt its messages into an [`ExecStream`].
pub async fn open(url: Url, token: Option<String>) -> Result<ExecStream> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| Error::Channel(format!("invalid exec request: {}", e)))?;
    let headers = request.headers_mut();
    headers.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(EXEC_PROTOCOL));
    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| Error::Config(format!("invalid bearer token: {}", e)))?;
        headers.insert(AUTHORIZATION, value);
    }

    let (socket, _) = connect_async(request)
        .await
        .map_err(|e| Error::Channel(format!("exec connect failed: {}", e)))?;
    debug!(url = %url.path(), "Exec session opened");

    let stream = futures::stream::unfold(Some(socket), next_frame);
    Ok(stream.boxed())
}

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn next_frame(socket: Option<Socket>) -> Option<(Result<ExecFrame>, Option<Socket>)> {
    let mut socket = socket?;
    loop {
        match socket.next().await {
            Some(Ok(Message::Binary(data))) => match decode_frame(&data) {
                Ok(Some(frame @ ExecFrame::Exit(_))) => return Some((Ok(frame), None)),
                Ok(Some(frame)) => return Some((Ok(frame), Some(socket))),
                Ok(None) => continue,
                Err(e) => return Some((Err(e), None)),
            },
            Some(Ok(Message::Close(_))) | None => return None,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Some((Err(Error::Channel(format!("exec stream broken: {}", e))), None));
            }
        }
    }
}

/// Decode one channel-prefixed message. Channels other than stdout,
/// stderr and status are ignored.
pub fn decode_frame(data: &[u8]) -> Result<Option<ExecFrame>> {
    let Some((channel, payload)) = data.split_first() else {
        return Ok(None);
    };
    match *channel {
        STDOUT_CHANNEL if !payload.is_empty() => Ok(Some(ExecFrame::Stdout(payload.to_vec()))),
        STDERR_CHANNEL if !payload.is_empty() => Ok(Some(ExecFrame::Stderr(payload.to_vec()))),
        STATUS_CHANNEL => parse_exec_status(payload).map(|code| Some(ExecFrame::Exit(code))),
        _ => Ok(None),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ExecStatus {
    status: String,
    reason: String,
    message: String,
    details: Option<StatusDetails>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StatusDetails {
    causes: Vec<StatusCause>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StatusCause {
    reason: String,
    message: String,
}

/// Exit code carried by the status channel. A failure that is not a
/// nonzero exit means the command never ran properly.
pub fn parse_exec_status(payload: &[u8]) -> Result<i32> {
    let status: ExecStatus = serde_json::from_slice(payload)?;
    if status.status == "Success" {
        return Ok(0);
    }
    if status.reason == "NonZeroExitCode" {
        let code = status
            .details
            .iter()
            .flat_map(|d| d.causes.iter())
            .find(|c| c.reason == "ExitCode")
            .and_then(|c| c.message.parse().ok());
        if let Some(code) = code {
            return Ok(code);
        }
    }
    Err(Error::Channel(format!("exec failed: {}", status.message)))
}
