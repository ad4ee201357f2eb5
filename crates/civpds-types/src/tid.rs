use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{TypeError, TypeResult};

const S32_ALPHABET: &[u8; 32] = b"234567abcdefghijklmnopqrstuvwxyz";
const TID_LEN: usize = 13;
const CLOCK_BITS: u32 = 10;

/// Time-ordered identifier.
///
/// A 13-character sortable base32 rendering of
/// `(microseconds_since_epoch << 10) | clock_id`. Lexicographic order of the
/// string equals numeric order of the underlying value, so TIDs compare
/// correctly as plain strings. Used for record keys and commit revs.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tid(String);

impl Tid {
    /// Build a TID from its timestamp and clock-id components.
    pub fn from_parts(micros: u64, clock_id: u16) -> Self {
        let value = (micros << CLOCK_BITS) | (u64::from(clock_id) & ((1 << CLOCK_BITS) - 1));
        Self(s32_encode(value & (u64::MAX >> 1)))
    }

    /// Parse and validate a TID string.
    pub fn parse(s: &str) -> TypeResult<Self> {
        if s.len() != TID_LEN {
            return Err(TypeError::InvalidTid(format!("{s:?}: expected 13 characters")));
        }
        if s32_decode(s).is_none() {
            return Err(TypeError::InvalidTid(format!("{s:?}: not sortable base32")));
        }
        // Top bit of the 64-bit value must be zero.
        if !b"234567abcdefghij".contains(&s.as_bytes()[0]) {
            return Err(TypeError::InvalidTid(format!("{s:?}: high bit set")));
        }
        Ok(Self(s.to_string()))
    }

    /// Microseconds since the Unix epoch.
    pub fn timestamp_micros(&self) -> u64 {
        s32_decode(&self.0).unwrap_or(0) >> CLOCK_BITS
    }

    /// Clock-id component.
    pub fn clock_id(&self) -> u16 {
        (s32_decode(&self.0).unwrap_or(0) & ((1 << CLOCK_BITS) - 1)) as u16
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tid({})", self.0)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Tid {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Tid {
    type Error = TypeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Tid> for String {
    fn from(tid: Tid) -> Self {
        tid.0
    }
}

fn s32_encode(mut value: u64) -> String {
    let mut out = [b'2'; TID_LEN];
    for slot in out.iter_mut().rev() {
        *slot = S32_ALPHABET[(value & 31) as usize];
        value >>= 5;
    }
    out.iter().map(|&b| b as char).collect()
}

fn s32_decode(s: &str) -> Option<u64> {
    let mut value: u64 = 0;
    for b in s.bytes() {
        let digit = S32_ALPHABET.iter().position(|&c| c == b)? as u64;
        value = value.checked_mul(32)?.checked_add(digit)?;
    }
    Some(value)
}

struct ClockState {
    last_micros: u64,
}

/// Process-local TID generator.
///
/// The clock id is drawn once from the thread CSPRNG in `0..32`. Successive
/// calls are strictly monotone: when the wall clock stalls or regresses the
/// previous timestamp plus one is used instead.
pub struct TidClock {
    clock_id: u16,
    state: Mutex<ClockState>,
}

impl TidClock {
    /// Create a clock with a random clock id.
    pub fn new() -> Self {
        Self::with_clock_id(rand::thread_rng().gen_range(0..32))
    }

    /// Create a clock with a fixed clock id.
    pub fn with_clock_id(clock_id: u16) -> Self {
        Self {
            clock_id,
            state: Mutex::new(ClockState { last_micros: 0 }),
        }
    }

    pub fn clock_id(&self) -> u16 {
        self.clock_id
    }

    /// Produce the next TID.
    pub fn next(&self) -> Tid {
        let wall = Self::wall_clock_micros();
        let mut state = self.state.lock().expect("lock poisoned");
        let micros = if wall > state.last_micros {
            wall
        } else {
            state.last_micros + 1
        };
        state.last_micros = micros;
        Tid::from_parts(micros, self.clock_id)
    }

    /// Produce a TID strictly greater than `floor`.
    ///
    /// Used when a commit must follow a rev minted by another process whose
    /// clock ran ahead of ours.
    pub fn next_after(&self, floor: Option<&Tid>) -> Tid {
        if let Some(floor) = floor {
            let mut state = self.state.lock().expect("lock poisoned");
            state.last_micros = state.last_micros.max(floor.timestamp_micros());
        }
        self.next()
    }

    fn wall_clock_micros() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }
}

impl Default for TidClock {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_CLOCK: OnceLock<TidClock> = OnceLock::new();

/// The process-wide clock, initialised on first use.
pub fn global_clock() -> &'static TidClock {
    GLOBAL_CLOCK.get_or_init(TidClock::new)
}

/// Next TID from the process-wide clock.
pub fn next_tid() -> Tid {
    global_clock().next()
}
