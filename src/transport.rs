//! Duplex transport seam.
//!
//! The connection manager opens one [`Link`] per connection attempt through a [`Transport`].
//! [`WsTransport`] is the production implementation on top of `tokio-tungstenite`; tests
//! substitute an in-memory transport.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, SinkExt as _, Stream, StreamExt as _, future};
use secrecy::{ExposeSecret as _, SecretString};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WsCloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use url::Url;

use crate::Result;
use crate::error::Error;
use crate::message::{CloseFrame, Frame, Payload};

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = Error> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame>> + Send>>;

/// An open transport handle, split into its outbound and inbound halves.
///
/// The stream ending, yielding an error, or yielding [`Frame::Close`] all mean the link is
/// gone; the manager never reuses a link after that.
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Link {
    #[must_use]
    pub fn new<Si, St>(sink: Si, stream: St) -> Self
    where
        Si: Sink<Frame, Error = Error> + Send + 'static,
        St: Stream<Item = Result<Frame>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

/// Everything a transport needs for one handshake.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub endpoint: Url,
    pub protocols: Vec<String>,
    /// Query parameter name under which the credential is sent
    pub token_param: String,
    pub credential: SecretString,
}

impl OpenRequest {
    /// The endpoint with the credential appended to its query string.
    #[must_use]
    pub fn authenticated_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair(&self.token_param, self.credential.expose_secret());
        url
    }
}

/// Opens duplex links. An error from [`Transport::open`] is an error before open.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, request: OpenRequest) -> Result<Link>;
}

/// WebSocket transport backed by `tokio-tungstenite`.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, request: OpenRequest) -> Result<Link> {
        let mut ws_request = request.authenticated_url().as_str().into_client_request()?;
        if !request.protocols.is_empty() {
            let protocols = HeaderValue::from_str(&request.protocols.join(", "))
                .map_err(|e| Error::validation(format!("invalid sub-protocol: {e}")))?;
            ws_request
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, protocols);
        }

        let (ws_stream, _) = connect_async(ws_request).await?;
        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(Error::from)
            .with(|frame: Frame| future::ready(Ok::<_, Error>(to_message(frame))));
        let stream = read.filter_map(|message| future::ready(from_message(message)));

        Ok(Link::new(sink, stream))
    }
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Message(Payload::Text(text)) => Message::Text(text.into()),
        Frame::Message(Payload::Binary(bytes)) => Message::Binary(bytes.into()),
        Frame::Close(close) => Message::Close(Some(WsCloseFrame {
            code: CloseCode::from(close.code),
            reason: Utf8Bytes::from(close.reason),
        })),
    }
}

/// Control frames are answered by tungstenite itself and not surfaced.
fn from_message(
    message: std::result::Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<Result<Frame>> {
    match message {
        Ok(Message::Text(text)) => Some(Ok(Frame::Message(Payload::Text(
            text.as_str().to_owned(),
        )))),
        Ok(Message::Binary(bytes)) => Some(Ok(Frame::Message(Payload::Binary(bytes.to_vec())))),
        Ok(Message::Close(frame)) => Some(Ok(Frame::Close(frame.map_or_else(
            || CloseFrame::abnormal("closed without status"),
            |f| CloseFrame::new(u16::from(f.code), f.reason.as_str()),
        )))),
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
        Err(e) => Some(Err(e.into())),
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;
    use crate::message::NORMAL_CLOSURE;

    #[test]
    fn credential_is_appended_to_query() {
        let request = OpenRequest {
            endpoint: Url::parse("wss://example.com/ws/chat?room=7").unwrap(),
            protocols: Vec::new(),
            token_param: "token".to_owned(),
            credential: SecretString::from("a b&c".to_owned()),
        };

        assert_eq!(
            request.authenticated_url().as_str(),
            "wss://example.com/ws/chat?room=7&token=a+b%26c"
        );
    }

    #[test]
    fn close_frames_round_trip_codes() {
        let message = to_message(Frame::Close(CloseFrame::normal()));
        let Message::Close(Some(frame)) = &message else {
            panic!("expected close message, got {message:?}");
        };
        assert_eq!(u16::from(frame.code), NORMAL_CLOSURE);

        let frame = from_message(Ok(message)).unwrap().unwrap();
        assert_eq!(frame, Frame::Close(CloseFrame::normal()));
    }

    #[test]
    fn control_frames_are_not_surfaced() {
        assert!(from_message(Ok(Message::Ping(Vec::new().into()))).is_none(), "ping");
        assert!(from_message(Ok(Message::Pong(Vec::new().into()))).is_none(), "pong");
    }

    #[test]
    fn close_without_status_is_abnormal() {
        let frame = from_message(Ok(Message::Close(None))).unwrap().unwrap();
        assert!(
            matches!(&frame, Frame::Close(close) if !close.is_normal()),
            "unexpected frame: {frame:?}"
        );
    }
}
