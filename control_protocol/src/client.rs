use crate::protocol::{InboundMessage, OutboundMessage, ProtocolError};
use log::{debug, info, warn};
use std::io::ErrorKind;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tungstenite::handshake::HandshakeError;
use tungstenite::{Message, WebSocket};
use url::Url;

/// Blocking WebSocket client for the server's control channel.
///
/// The socket carries a short read timeout so a single thread can both poll
/// for inbound messages and flush outbound ones.
pub struct ControlClient {
    socket: WebSocket<TcpStream>,
    url: Url,
}

impl ControlClient {
    pub fn connect(
        url: &str,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, ProtocolError> {
        let url = Url::parse(url)?;
        info!("📡 Connecting to control channel at {}", url);

        let host = url.host_str().ok_or_else(|| ProtocolError::Malformed {
            kind: "url",
            reason: format!("'{url}' has no host"),
        })?;
        let port = url.port_or_known_default().unwrap_or(80);

        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| std::io::Error::new(ErrorKind::NotFound, "host did not resolve"))?;

        let stream = TcpStream::connect_timeout(&addr, connect_timeout)?;
        stream.set_nodelay(true)?;
        // Handshake runs with the longer timeout, then drops to polling mode.
        stream.set_read_timeout(Some(connect_timeout))?;
        stream.set_write_timeout(Some(connect_timeout))?;

        let (socket, _response) = match tungstenite::client(url.as_str(), stream) {
            Ok(pair) => pair,
            Err(HandshakeError::Failure(e)) => return Err(e.into()),
            Err(HandshakeError::Interrupted(_)) => {
                return Err(std::io::Error::new(
                    ErrorKind::TimedOut,
                    "WebSocket handshake timed out",
                )
                .into())
            }
        };

        socket.get_ref().set_read_timeout(Some(read_timeout))?;

        info!("✅ Control channel connected");
        Ok(Self { socket, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Serialize and send one message, returning the frame size in bytes.
    pub fn send(&mut self, message: &OutboundMessage) -> Result<usize, ProtocolError> {
        let json = message.to_json()?;
        let len = json.len();
        debug!("📤 Sending {} ({} bytes)", message.type_name(), len);
        self.socket.send(Message::Text(json)).map_err(map_ws_error)?;
        Ok(len)
    }

    /// Poll for the next message.
    ///
    /// Returns `Ok(None)` when the read timed out or a control frame was
    /// handled internally. A malformed text frame is reported as an error for
    /// that message only; [`ProtocolError::is_malformed`] tells them apart
    /// from connection failures.
    pub fn read_message(&mut self) -> Result<Option<InboundMessage>, ProtocolError> {
        match self.socket.read() {
            Ok(Message::Text(text)) => InboundMessage::parse(&text).map(Some),
            Ok(Message::Binary(data)) => {
                warn!("⚠️ Ignoring {} byte binary frame on control channel", data.len());
                Ok(None)
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {
                // Pongs are queued by tungstenite; push them out.
                self.flush()?;
                Ok(None)
            }
            Ok(Message::Close(frame)) => {
                info!("🔌 Control channel closed by server: {:?}", frame);
                Err(ProtocolError::Closed)
            }
            Err(tungstenite::Error::Io(e))
                if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                Ok(None)
            }
            Err(e) => Err(map_ws_error(e)),
        }
    }

    pub fn flush(&mut self) -> Result<(), ProtocolError> {
        match self.socket.flush() {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::Io(e))
                if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                Ok(())
            }
            Err(e) => Err(map_ws_error(e)),
        }
    }

    pub fn close(&mut self) {
        debug!("👋 Closing control channel");
        if let Err(e) = self.socket.close(None) {
            debug!("Close handshake incomplete: {}", e);
        }
        let _ = self.socket.flush();
    }
}

fn map_ws_error(e: tungstenite::Error) -> ProtocolError {
    match e {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            ProtocolError::Closed
        }
        tungstenite::Error::Io(io)
            if matches!(
                io.kind(),
                ErrorKind::UnexpectedEof
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
            ) =>
        {
            ProtocolError::Closed
        }
        other => ProtocolError::WebSocket(other),
    }
}
