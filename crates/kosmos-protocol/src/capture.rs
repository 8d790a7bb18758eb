//! Capture entry layouts: LED spy, I²C spy and PES timers.

use core::fmt;

use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::timer_cmd;

/// Width of the LED spy tick counter.
pub const LED_COUNTER_BITS: u32 = 24;
/// Largest LED channel index.
pub const LED_CHANNEL_MAX: u8 = 0x7F;

/// Width of the I²C spy delta field.
pub const I2C_DELTA_BITS: u32 = 21;
/// Ticks added by an I²C `WRAP` entry.
pub const I2C_WRAP_TICKS: u64 = 1 << I2C_DELTA_BITS;

/// LED spy entry: `counter:24, channel:7, inactive:1`.
///
/// `counter` is the tick count elapsed on that channel since its previous entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LedSpyEntry {
    pub counter: u32,
    pub channel: u8,
    pub inactive: bool,
}

impl LedSpyEntry {
    pub fn encode(&self) -> ProtocolResult<u32> {
        if self.counter >= 1 << LED_COUNTER_BITS {
            return Err(ProtocolError::out_of_range(
                "counter",
                self.counter,
                0,
                (1u32 << LED_COUNTER_BITS) - 1,
            ));
        }
        if self.channel > LED_CHANNEL_MAX {
            return Err(ProtocolError::out_of_range(
                "channel",
                self.channel,
                0,
                LED_CHANNEL_MAX,
            ));
        }
        Ok((u32::from(self.inactive) << 31) | (u32::from(self.channel) << 24) | self.counter)
    }

    pub fn decode(word: u32) -> Self {
        Self {
            counter: word & ((1 << LED_COUNTER_BITS) - 1),
            channel: ((word >> 24) & u32::from(LED_CHANNEL_MAX)) as u8,
            inactive: word >> 31 == 1,
        }
    }
}

/// LED state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LedEvent {
    pub channel: u8,
    pub active: bool,
}

/// Turn LED spy entries into timestamped events.
///
/// Timestamps accumulate per channel. The result is ordered by timestamp,
/// ties keeping capture order.
pub fn parse_led_entries(words: &[u32]) -> Vec<(u64, LedEvent)> {
    let mut clocks = [0u64; LED_CHANNEL_MAX as usize + 1];
    let mut events = Vec::with_capacity(words.len());
    for word in words {
        let entry = LedSpyEntry::decode(*word);
        if let Some(clock) = clocks.get_mut(usize::from(entry.channel)) {
            *clock += u64::from(entry.counter);
            events.push((
                *clock,
                LedEvent {
                    channel: entry.channel,
                    active: !entry.inactive,
                },
            ));
        }
    }
    events.sort_by_key(|(ts, _)| *ts);
    events
}

/// I²C spy entry kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum I2cEventKind {
    Start,
    Stop,
    ByteAck,
    ByteNack,
    /// Delta counter wrapped, adds [`I2C_WRAP_TICKS`].
    Wrap,
}

impl I2cEventKind {
    pub fn to_u8(self) -> u8 {
        match self {
            I2cEventKind::Start => 0,
            I2cEventKind::Stop => 1,
            I2cEventKind::ByteAck => 2,
            I2cEventKind::ByteNack => 3,
            I2cEventKind::Wrap => 7,
        }
    }

    pub fn from_u8(value: u8) -> ProtocolResult<Self> {
        match value {
            0 => Ok(I2cEventKind::Start),
            1 => Ok(I2cEventKind::Stop),
            2 => Ok(I2cEventKind::ByteAck),
            3 => Ok(I2cEventKind::ByteNack),
            7 => Ok(I2cEventKind::Wrap),
            other => Err(ProtocolError::InvalidValue {
                what: "I2C event kind",
                value: u32::from(other),
            }),
        }
    }
}

/// I²C spy entry: `data:8, kind:3, delta:21`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct I2cSpyEntry {
    pub data: u8,
    pub kind: I2cEventKind,
    pub delta: u32,
}

impl I2cSpyEntry {
    pub fn encode(&self) -> ProtocolResult<u32> {
        if self.delta >= 1 << I2C_DELTA_BITS {
            return Err(ProtocolError::out_of_range(
                "delta",
                self.delta,
                0,
                (1u32 << I2C_DELTA_BITS) - 1,
            ));
        }
        Ok((self.delta << 11) | (u32::from(self.kind.to_u8()) << 8) | u32::from(self.data))
    }

    pub fn decode(word: u32) -> ProtocolResult<Self> {
        Ok(Self {
            data: (word & 0xFF) as u8,
            kind: I2cEventKind::from_u8(((word >> 8) & 0x07) as u8)?,
            delta: word >> 11,
        })
    }
}

/// Bus event seen by the I²C spy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum I2cEvent {
    Start,
    Stop,
    Byte { data: u8, ack: bool },
}

/// Turn I²C spy entries into timestamped bus events; `WRAP` entries only advance time.
pub fn parse_i2c_entries(words: &[u32]) -> ProtocolResult<Vec<(u64, I2cEvent)>> {
    let mut now = 0u64;
    let mut events = Vec::with_capacity(words.len());
    for word in words {
        let entry = I2cSpyEntry::decode(*word)?;
        now += u64::from(entry.delta);
        let event = match entry.kind {
            I2cEventKind::Start => I2cEvent::Start,
            I2cEventKind::Stop => I2cEvent::Stop,
            I2cEventKind::ByteAck => I2cEvent::Byte {
                data: entry.data,
                ack: true,
            },
            I2cEventKind::ByteNack => I2cEvent::Byte {
                data: entry.data,
                ack: false,
            },
            I2cEventKind::Wrap => {
                now += I2C_WRAP_TICKS;
                continue;
            }
        };
        events.push((now, event));
    }
    Ok(events)
}

/// One I²C transaction, START to STOP (or repeated START).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct I2cFrame {
    /// Timestamp of the START condition.
    pub timestamp: u64,
    /// 7-bit target address.
    pub address: u8,
    pub read: bool,
    pub data: Vec<u8>,
    /// Every byte, address included, was acknowledged.
    pub acked: bool,
}

/// Group bus events into frames. Bytes outside START..STOP are dropped.
pub fn group_i2c_frames(events: &[(u64, I2cEvent)]) -> Vec<I2cFrame> {
    let mut frames = Vec::new();
    let mut current: Option<(u64, Vec<u8>, bool)> = None;

    let mut close = |current: &mut Option<(u64, Vec<u8>, bool)>| {
        if let Some((timestamp, bytes, acked)) = current.take()
            && let Some((&first, data)) = bytes.split_first()
        {
            frames.push(I2cFrame {
                timestamp,
                address: first >> 1,
                read: first & 1 == 1,
                data: data.to_vec(),
                acked,
            });
        }
    };

    for (timestamp, event) in events {
        match event {
            I2cEvent::Start => {
                close(&mut current);
                current = Some((*timestamp, Vec::new(), true));
            }
            I2cEvent::Stop => close(&mut current),
            I2cEvent::Byte { data, ack } => {
                if let Some((_, bytes, acked)) = current.as_mut() {
                    bytes.push(*data);
                    *acked &= *ack;
                }
            }
        }
    }
    close(&mut current);
    frames
}

/// PES timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    Global,
    Local,
    Stopwatch1,
    Stopwatch2,
}

impl TimerId {
    pub const ALL: [TimerId; 4] = [
        TimerId::Global,
        TimerId::Local,
        TimerId::Stopwatch1,
        TimerId::Stopwatch2,
    ];

    /// Position in the timers status reply.
    pub fn index(self) -> usize {
        match self {
            TimerId::Global => 0,
            TimerId::Local => 1,
            TimerId::Stopwatch1 => 2,
            TimerId::Stopwatch2 => 3,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Ticks the hardware adds to a saved value.
    ///
    /// Timestamps include the two ticks of the marker pipeline; stopwatches do not.
    pub fn offset_ticks(self) -> u64 {
        match self {
            TimerId::Global | TimerId::Local => 2,
            TimerId::Stopwatch1 | TimerId::Stopwatch2 => 0,
        }
    }

    /// First read command of this timer.
    pub fn read_cmd_base(self) -> u8 {
        match self {
            TimerId::Global => timer_cmd::GLOBAL_READ_1,
            TimerId::Local => timer_cmd::LOCAL_READ_1,
            TimerId::Stopwatch1 => timer_cmd::STOPWATCH_1_READ_1,
            TimerId::Stopwatch2 => timer_cmd::STOPWATCH_2_READ_1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TimerId::Global => "GLOBAL",
            TimerId::Local => "LOCAL",
            TimerId::Stopwatch1 => "STOPWATCH_1",
            TimerId::Stopwatch2 => "STOPWATCH_2",
        }
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
