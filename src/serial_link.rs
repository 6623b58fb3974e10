use serialport::{DataBits, Parity, SerialPort, StopBits};
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

/// Baud rate both gauges are configured for.
pub const BAUD_RATE: u32 = 9600;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Link '{name}' is already closed")]
    Closed { name: String },
}

/// An ordered byte channel to one gauge.
///
/// The protocol layer only ever asks for as many bytes as `bytes_available`
/// reported, so `read` is allowed to come back short when the source runs dry.
pub trait GaugeLink {
    /// Human readable name of the link, used in log messages.
    fn name(&self) -> &str;

    /// Send `bytes` to the device and return how many were written.
    fn write(&mut self, bytes: &[u8]) -> Result<usize, LinkError>;

    /// Number of received bytes waiting to be read.
    fn bytes_available(&mut self) -> Result<usize, LinkError>;

    /// Read up to `n` pending bytes.
    fn read(&mut self, n: usize) -> Result<Vec<u8>, LinkError>;

    /// Release the underlying channel. Closing twice is not an error.
    fn close(&mut self) -> Result<(), LinkError>;
}

impl<L: GaugeLink + ?Sized> GaugeLink for Box<L> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, LinkError> {
        (**self).write(bytes)
    }

    fn bytes_available(&mut self) -> Result<usize, LinkError> {
        (**self).bytes_available()
    }

    fn read(&mut self, n: usize) -> Result<Vec<u8>, LinkError> {
        (**self).read(n)
    }

    fn close(&mut self) -> Result<(), LinkError> {
        (**self).close()
    }
}

/// Owned, type-erased link as stored by a session.
pub type BoxedLink = Box<dyn GaugeLink + Send>;

/// A gauge attached to a real serial port (9600 8N1).
#[derive(Debug)]
pub struct SerialLink {
    name: String,
    serial: Option<Box<dyn SerialPort>>,
}

impl SerialLink {
    /// Open `port` with the gauge line settings
    pub fn open(port: &str) -> Result<Self, LinkError> {
        log::debug!("Opening serial port {} at {} baud", port, BAUD_RATE);
        let serial = serialport::new(port, BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(Duration::from_millis(10))
            .open()?;

        Ok(Self {
            name: port.to_string(),
            serial: Some(serial),
        })
    }

    fn serial(&mut self) -> Result<&mut Box<dyn SerialPort>, LinkError> {
        self.serial.as_mut().ok_or_else(|| LinkError::Closed {
            name: self.name.clone(),
        })
    }
}

impl GaugeLink for SerialLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, LinkError> {
        let serial = self.serial()?;
        serial.write_all(bytes)?;
        serial.flush()?;
        Ok(bytes.len())
    }

    fn bytes_available(&mut self) -> Result<usize, LinkError> {
        Ok(self.serial()?.bytes_to_read()? as usize)
    }

    fn read(&mut self, n: usize) -> Result<Vec<u8>, LinkError> {
        let serial = self.serial()?;
        let mut buffer = vec![0u8; n];
        let mut filled = 0;

        while filled < n {
            match serial.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(count) => filled += count,
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        buffer.truncate(filled);
        Ok(buffer)
    }

    fn close(&mut self) -> Result<(), LinkError> {
        if let Some(serial) = self.serial.take() {
            log::debug!("Closing serial port {}", self.name);
            drop(serial);
        }
        Ok(())
    }
}
