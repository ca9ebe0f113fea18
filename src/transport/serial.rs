//! Serial transport for controllers attached over USB or UART.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::error::{Error, Result};
use crate::protocol::{FrameDecoder, encode_frame};
use crate::transport::Transport;

/// Default baud rate of the controller's serial interface.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Default connection delay.
pub const DEFAULT_CONNECTION_DELAY: Duration = Duration::from_millis(300);

/// Configuration for serial transport.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Serial port path (e.g., "/dev/ttyACM0" or "COM3").
    pub port: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Delay after opening the port before the first frame is sent.
    pub connection_delay: Duration,
}

impl SerialConfig {
    /// Creates a new serial configuration with default settings.
    #[must_use]
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            connection_delay: DEFAULT_CONNECTION_DELAY,
        }
    }

    /// Sets the baud rate.
    #[must_use]
    pub const fn baud_rate(mut self, rate: u32) -> Self {
        self.baud_rate = rate;
        self
    }

    /// Sets the connection delay.
    #[must_use]
    pub const fn connection_delay(mut self, delay: Duration) -> Self {
        self.connection_delay = delay;
        self
    }
}

/// Serial transport for the controller link.
///
/// The write half is kept behind a mutex; the read half is moved into a
/// background task that decodes frames and forwards their bodies.
pub struct SerialTransport {
    config: SerialConfig,
    writer: Option<Arc<Mutex<WriteHalf<SerialStream>>>>,
    read_task: Option<JoinHandle<()>>,
    frame_tx: Option<mpsc::Sender<Bytes>>,
}

impl SerialTransport {
    /// Creates a new serial transport with the given configuration.
    #[must_use]
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            writer: None,
            read_task: None,
            frame_tx: None,
        }
    }

    /// Creates a new serial transport for the given port with default settings.
    #[must_use]
    pub fn with_port(port: impl Into<String>) -> Self {
        Self::new(SerialConfig::new(port))
    }

    /// Reads from the port until it closes, forwarding decoded frame bodies.
    async fn run_read_loop(
        mut reader: ReadHalf<SerialStream>,
        frame_tx: mpsc::Sender<Bytes>,
    ) -> Result<()> {
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 1024];

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => {
                    tracing::debug!("serial port closed");
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "serial port closed",
                    )));
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::error!("serial read error: {}", e);
                    return Err(Error::Io(e));
                }
            };

            tracing::trace!("received {} bytes", n);
            decoder.feed(&buf[..n]);

            loop {
                match decoder.decode() {
                    Ok(Some(body)) => {
                        tracing::trace!("decoded frame: {}", hex::encode(&body));
                        if frame_tx.send(body).await.is_err() {
                            tracing::debug!("frame receiver dropped");
                            return Ok(());
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        // Bad frame already dropped by the decoder
                        tracing::warn!("frame decode error: {}", e);
                    }
                }
            }
        }
    }
}

impl Transport for SerialTransport {
    fn set_frame_sender(&mut self, tx: mpsc::Sender<Bytes>) {
        self.frame_tx = Some(tx);
    }

    fn connect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.writer.is_some() {
                return Ok(());
            }
            let frame_tx = self.frame_tx.clone().ok_or_else(|| Error::Config {
                reason: "no frame sender set before connect".into(),
            })?;

            tracing::info!("connecting to serial port: {}", self.config.port);

            let mut stream = tokio_serial::new(&self.config.port, self.config.baud_rate)
                .open_native_async()
                .map_err(Error::Serial)?;

            if let Err(e) = tokio_serial::SerialPort::write_request_to_send(&mut stream, false) {
                tracing::warn!("failed to set RTS: {}", e);
            }

            tokio::time::sleep(self.config.connection_delay).await;

            // Stale bytes from before the port was opened
            let mut buf = [0u8; 1024];
            let mut total_drained = 0usize;
            let drain_deadline = tokio::time::Instant::now() + Duration::from_millis(500);
            while tokio::time::Instant::now() < drain_deadline {
                match tokio::time::timeout(Duration::from_millis(20), stream.read(&mut buf)).await {
                    Ok(Ok(n)) if n > 0 => total_drained += n,
                    _ => tokio::time::sleep(Duration::from_millis(10)).await,
                }
            }
            if total_drained > 0 {
                tracing::debug!("drained {} stale bytes from buffer", total_drained);
            }

            let (reader, writer) = tokio::io::split(stream);
            self.writer = Some(Arc::new(Mutex::new(writer)));
            self.read_task = Some(tokio::spawn(async move {
                if let Err(e) = Self::run_read_loop(reader, frame_tx).await {
                    tracing::error!("read loop error: {}", e);
                }
            }));

            tracing::info!("connected to serial port");
            Ok(())
        })
    }

    fn disconnect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if let Some(task) = self.read_task.take() {
                task.abort();
            }
            if self.writer.take().is_some() {
                tracing::info!("disconnected from serial port");
            }
            Ok(())
        })
    }

    fn send(&mut self, body: Bytes) -> BoxFuture<'_, Result<()>> {
        let writer = self.writer.clone();
        Box::pin(async move {
            let writer = writer.ok_or(Error::NotConnected)?;
            let frame = encode_frame(&body)?;
            tracing::trace!("sending frame: {}", hex::encode(&frame));

            let mut writer = writer.lock().await;
            writer.write_all(&frame).await.map_err(Error::Io)?;
            writer.flush().await.map_err(Error::Io)?;
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.writer.is_some()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

/// Lists available serial ports.
///
/// # Errors
///
/// Returns an error if the port list cannot be retrieved.
pub fn list_ports() -> Result<Vec<String>> {
    let ports = tokio_serial::available_ports().map_err(Error::Serial)?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_config_defaults() {
        let config = SerialConfig::new("/dev/ttyACM0");
        assert_eq!(config.port, "/dev/ttyACM0");
        assert_eq!(config.baud_rate, DEFAULT_BAUD_RATE);
        assert_eq!(config.connection_delay, DEFAULT_CONNECTION_DELAY);
    }

    #[test]
    fn test_serial_config_builder() {
        let config = SerialConfig::new("/dev/ttyACM0")
            .baud_rate(9600)
            .connection_delay(Duration::from_secs(1));
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.connection_delay, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_connect_requires_frame_sender() {
        let mut transport = SerialTransport::with_port("/dev/null-controller");
        assert!(matches!(
            transport.connect().await,
            Err(Error::Config { .. })
        ));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_send_when_disconnected() {
        let mut transport = SerialTransport::with_port("/dev/null-controller");
        assert!(matches!(
            transport.send(Bytes::from_static(&[0x00, 0x08])).await,
            Err(Error::NotConnected)
        ));
    }

    #[test]
    #[ignore = "Requires /sys/class/tty - not available in sandboxed builds"]
    fn test_list_ports() {
        let _ = list_ports();
    }
}
