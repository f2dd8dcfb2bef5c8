//! Length-prefixed request/response exchange over a serial channel.
//!
//! A frame starts with a header holding a big-endian length field at a fixed
//! offset and ends with a check region of fixed size. Checksum validation is
//! left to the vendor protocol; this module only guarantees the bytes arrived
//! within a bounded polling budget.

use crate::constants::*;
use crate::error::{BmsError, FrameStage, Result};
use serialport::{ClearBuffer, SerialPort};
use std::io::{ErrorKind, Read, Write};
use std::thread;
use std::time::Duration;

/// Byte-stream channel the framed transport talks through.
pub trait SerialChannel {
    /// Discard anything pending in both directions.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Write the whole buffer.
    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Bytes that can be read without blocking.
    fn bytes_available(&mut self) -> Result<usize>;

    /// Read into `buf`, returning 0 when the channel read timed out.
    fn receive(&mut self, buf: &mut [u8]) -> Result<usize>;
}

impl SerialChannel for Box<dyn SerialPort> {
    fn clear_buffers(&mut self) -> Result<()> {
        self.clear(ClearBuffer::All)?;
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        log::trace!("write bytes: {:02X?}", data);
        Write::write_all(self, data)?;
        Ok(())
    }

    fn bytes_available(&mut self) -> Result<usize> {
        Ok(self.bytes_to_read()? as usize)
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
        match Read::read(self, buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

/// Opens serial channels by name and baud rate.
pub trait ChannelProvider {
    type Channel: SerialChannel;

    fn open(&self, port: &str, baud: u32) -> Result<Self::Channel>;
}

/// Provider backed by the `serialport` crate.
#[derive(Debug, Clone)]
pub struct SerialPortProvider {
    timeout: Duration,
}

impl SerialPortProvider {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SerialPortProvider {
    fn default() -> Self {
        Self::new(CHANNEL_READ_TIMEOUT)
    }
}

impl ChannelProvider for SerialPortProvider {
    type Channel = Box<dyn SerialPort>;

    fn open(&self, port: &str, baud: u32) -> Result<Self::Channel> {
        Ok(serialport::new(port, baud).timeout(self.timeout).open()?)
    }
}

/// Width of the big-endian length field in a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthField {
    U8,
    U16,
    U32,
}

impl LengthField {
    /// Map a struct format character (`B`, `H`, `I`, `L`) to a field width.
    pub fn from_format_char(c: char) -> Result<Self> {
        match c.to_ascii_uppercase() {
            'B' => Ok(LengthField::U8),
            'H' => Ok(LengthField::U16),
            'I' | 'L' => Ok(LengthField::U32),
            other => Err(BmsError::InvalidLengthField(other.to_string())),
        }
    }

    /// Map a byte width (1, 2 or 4) to a field width.
    pub fn from_width(width: usize) -> Result<Self> {
        match width {
            1 => Ok(LengthField::U8),
            2 => Ok(LengthField::U16),
            4 => Ok(LengthField::U32),
            other => Err(BmsError::InvalidLengthField(format!("{other} bytes"))),
        }
    }

    pub fn width(self) -> usize {
        match self {
            LengthField::U8 => 1,
            LengthField::U16 => 2,
            LengthField::U32 => 4,
        }
    }

    /// Decode the field at `pos`; `None` if the buffer is too short.
    pub fn decode(self, data: &[u8], pos: usize) -> Option<usize> {
        let bytes = data.get(pos..pos.checked_add(self.width())?)?;
        Some(match self {
            LengthField::U8 => bytes[0] as usize,
            LengthField::U16 => u16::from_be_bytes([bytes[0], bytes[1]]) as usize,
            LengthField::U32 => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize,
        })
    }
}

/// Shape of the response expected for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSpec {
    /// Offset of the length field
    pub length_pos: usize,
    /// Width of the length field
    pub length_field: LengthField,
    /// Payload length to use instead of decoding the length field
    pub length_fixed: Option<usize>,
    /// Size of the trailing check region
    pub length_check: usize,
}

impl FrameSpec {
    pub fn new(length_pos: usize, length_field: LengthField, length_check: usize) -> Self {
        Self {
            length_pos,
            length_field,
            length_fixed: None,
            length_check,
        }
    }

    pub fn with_fixed_length(mut self, length: usize) -> Self {
        self.length_fixed = Some(length);
        self
    }

    /// Bytes needed before the length field can be decoded; `None` on overflow.
    pub fn header_len(&self) -> Option<usize> {
        self.length_pos.checked_add(self.length_field.width())
    }
}

/// Framed request/response driver over one open channel.
pub struct FramedTransport<C: SerialChannel> {
    channel: C,
    poll_interval: Duration,
    online: bool,
}

impl<C: SerialChannel> FramedTransport<C> {
    /// Wrap an already open channel
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            poll_interval: FRAME_POLL_INTERVAL,
            online: true,
        }
    }

    /// Open a channel through `provider`, retrying on transport failures
    pub fn open<P>(provider: &P, port: &str, baud: u32) -> Result<Self>
    where
        P: ChannelProvider<Channel = C>,
    {
        Ok(Self::new(open_channel(provider, port, baud)?))
    }

    /// Change the spacing between availability polls
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Record whether the battery answered before; only changes log severity
    pub fn set_online(&mut self, online: bool) {
        self.online = online;
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    pub fn into_inner(self) -> C {
        self.channel
    }

    /// Write `command` and read back one complete frame.
    pub fn read_frame(&mut self, command: &[u8], spec: &FrameSpec) -> Result<Vec<u8>> {
        self.channel.clear_buffers()?;
        self.channel.send(command)?;

        let header_len = spec.header_len().ok_or(BmsError::MalformedFrame {
            observed: 0,
            required: usize::MAX,
        })?;
        let mut count = 0;
        let mut available = self.channel.bytes_available()?;
        while available < header_len {
            thread::sleep(self.poll_interval);
            available = self.channel.bytes_available()?;
            count += 1;
            if count >= HEADER_POLL_BUDGET {
                connection_lost(self.online, None);
                return Err(BmsError::TransportTimeout {
                    stage: FrameStage::Header,
                    observed: available,
                    expected: header_len,
                    online: self.online,
                });
            }
        }

        let mut data = vec![0u8; available];
        let n = self.channel.receive(&mut data)?;
        data.truncate(n);
        if data.len() < header_len {
            connection_lost(self.online, Some(&format!("[len:{}]", data.len())));
            return Err(BmsError::MalformedFrame {
                observed: data.len(),
                required: header_len,
            });
        }

        let length = match spec.length_fixed {
            Some(length) => length,
            None => spec
                .length_field
                .decode(&data, spec.length_pos)
                .ok_or(BmsError::MalformedFrame {
                    observed: data.len(),
                    required: header_len,
                })?,
        };
        let total = length
            .checked_add(spec.length_check)
            .ok_or(BmsError::MalformedFrame {
                observed: data.len(),
                required: length,
            })?;
        log::trace!("frame length {} + check {}", length, spec.length_check);

        let mut count = 0;
        while data.len() < total {
            let pending = self.channel.bytes_available()?;
            if pending > 0 {
                let mut chunk = vec![0u8; pending.min(total - data.len())];
                let n = self.channel.receive(&mut chunk)?;
                data.extend_from_slice(&chunk[..n]);
                if data.len() >= total {
                    break;
                }
            }
            thread::sleep(self.poll_interval);
            count += 1;
            if count >= PAYLOAD_POLL_BUDGET {
                connection_lost(self.online, Some(&format!("[len:{}/{}]", data.len(), total)));
                return Err(BmsError::TransportTimeout {
                    stage: FrameStage::Payload,
                    observed: data.len(),
                    expected: total,
                    online: self.online,
                });
            }
        }

        log::trace!("receive bytes: {:02X?}", data);
        Ok(data)
    }
}

/// Open a channel, retrying up to [`OPEN_ATTEMPTS`] times.
pub fn open_channel<P: ChannelProvider>(provider: &P, port: &str, baud: u32) -> Result<P::Channel> {
    for attempt in 1..=OPEN_ATTEMPTS {
        match provider.open(port, baud) {
            Ok(channel) => return Ok(channel),
            Err(e) => log::error!("opening {} (attempt {}/{}): {}", port, attempt, OPEN_ATTEMPTS, e),
        }
    }
    Err(BmsError::ChannelUnavailable {
        port: port.to_string(),
        attempts: OPEN_ATTEMPTS,
    })
}

/// One-shot exchange: open `port`, read a single frame, release the channel.
///
/// The channel is dropped on every exit path, including timeouts.
pub fn read_serial_data<P: ChannelProvider>(
    provider: &P,
    port: &str,
    baud: u32,
    command: &[u8],
    spec: &FrameSpec,
    online: bool,
) -> Result<Vec<u8>> {
    let mut transport = FramedTransport::open(provider, port, baud)?;
    transport.set_online(online);
    let result = transport.read_frame(command, spec);
    drop(transport);
    if let Err(e) = &result {
        log::debug!("exchange on {} failed, channel released: {}", port, e);
    }
    result
}

/// List serial ports present on this host.
pub fn list_ports() -> Result<Vec<serialport::SerialPortInfo>> {
    Ok(serialport::available_ports()?)
}

/// Identifier for a serial BMS, unique per port and bus address.
pub fn unique_identifier(port: &str, address: Option<&[u8]>) -> String {
    let address = match address {
        Some(bytes) => bytes.iter().map(|b| format!("0x{b:02x}")).collect::<String>(),
        None => "0x01".to_string(),
    };
    format!("{}__{}", port.replace("/dev/", ""), address)
}

fn connection_lost(online: bool, suffix: Option<&str>) {
    if online {
        log::error!(
            ">>> No response from battery. Connection lost or battery not recognized. Check cabling!{}",
            suffix.map(|s| format!(" {s}")).unwrap_or_default()
        );
    } else {
        log::info!("  |- No battery recognized");
    }
}
