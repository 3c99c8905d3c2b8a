//! Command packets submitted to the scheduler.
//!
//! A [`Command`] is the externally owned payload of a job: its opcode, the
//! set of compute units it may run on, and the register map handed to the
//! unit that executes it. Configuration commands travel through the same
//! queue as work commands but never occupy a compute unit.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KdsError, Result};

/// Upper bound on hardware or soft compute units per device.
pub const MAX_CUS: usize = 128;

/// Upper bound on command queue slots.
pub const MAX_SLOTS: usize = 128;

/// Bits per mask word.
pub const MASK_BITS: usize = 32;

/// Number of 32-bit words needed to describe every CU.
pub const CU_MASK_WORDS: usize = MAX_CUS / MASK_BITS;

/// Command opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Opcode {
    StartCu,
    Configure,
    ExecWrite,
    CopyBo,
    SkConfig,
    SkStart,
    SkUnconfig,
    InitCu,
}

impl Opcode {
    /// Configuration opcodes are processed by the scheduler itself and
    /// never allocate a compute unit.
    pub fn is_config(self) -> bool {
        matches!(
            self,
            Opcode::Configure | Opcode::InitCu | Opcode::SkConfig | Opcode::SkUnconfig
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::StartCu => "start_cu",
            Opcode::Configure => "configure",
            Opcode::ExecWrite => "exec_write",
            Opcode::CopyBo => "copy_bo",
            Opcode::SkConfig => "sk_config",
            Opcode::SkStart => "sk_start",
            Opcode::SkUnconfig => "sk_unconfig",
            Opcode::InitCu => "init_cu",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of a job.
///
/// Discriminants match the values reflected back to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CmdState {
    New = 1,
    Queued = 2,
    Running = 3,
    Completed = 4,
    Error = 5,
    Abort = 6,
    Timeout = 8,
    NoResponse = 9,
}

impl CmdState {
    /// All states, in discriminant order.
    pub const ALL: [CmdState; 8] = [
        CmdState::New,
        CmdState::Queued,
        CmdState::Running,
        CmdState::Completed,
        CmdState::Error,
        CmdState::Abort,
        CmdState::Timeout,
        CmdState::NoResponse,
    ];

    /// A terminal state is followed only by retirement.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CmdState::Completed
                | CmdState::Error
                | CmdState::Abort
                | CmdState::Timeout
                | CmdState::NoResponse
        )
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_u8() == value)
    }

    /// Position of this state in [`CmdState::ALL`].
    pub fn index(self) -> usize {
        Self::ALL.iter().position(|s| *s == self).unwrap_or(0)
    }
}

impl fmt::Display for CmdState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CmdState::New => "new",
            CmdState::Queued => "queued",
            CmdState::Running => "running",
            CmdState::Completed => "completed",
            CmdState::Error => "error",
            CmdState::Abort => "abort",
            CmdState::Timeout => "timeout",
            CmdState::NoResponse => "noresponse",
        };
        f.write_str(name)
    }
}

/// Execution strategy selected at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    /// The scheduler drives CUs directly and tracks completion itself.
    #[default]
    Software,
    /// An embedded scheduler on the device tracks completion.
    Embedded,
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecMode::Software => f.write_str("software"),
            ExecMode::Embedded => f.write_str("embedded"),
        }
    }
}

/// Set of acceptable CU indices, as little-endian 32-bit words.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CuMask(Vec<u32>);

impl CuMask {
    /// Mask from raw words; word `n` covers CUs `32n..32n+31`.
    pub fn from_words(words: Vec<u32>) -> Result<Self> {
        if words.len() > CU_MASK_WORDS {
            return Err(KdsError::InvalidCommand(format!(
                "cu mask has {} words, at most {} supported",
                words.len(),
                CU_MASK_WORDS
            )));
        }
        Ok(Self(words))
    }

    /// Single-word mask covering CUs 0..32.
    pub fn from_word(word: u32) -> Self {
        Self(vec![word])
    }

    pub fn from_indices(indices: &[usize]) -> Result<Self> {
        let mut words = Vec::new();
        for &idx in indices {
            if idx >= MAX_CUS {
                return Err(KdsError::InvalidCommand(format!("cu index {} out of range", idx)));
            }
            let word = idx / MASK_BITS;
            if words.len() <= word {
                words.resize(word + 1, 0);
            }
            words[word] |= 1 << (idx % MASK_BITS);
        }
        Ok(Self(words))
    }

    pub fn words(&self) -> &[u32] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    pub fn contains(&self, idx: usize) -> bool {
        self.0
            .get(idx / MASK_BITS)
            .map(|w| w & (1 << (idx % MASK_BITS)) != 0)
            .unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().enumerate().flat_map(|(word_idx, word)| {
            (0..MASK_BITS)
                .filter(move |bit| word & (1 << bit) != 0)
                .map(move |bit| word_idx * MASK_BITS + bit)
        })
    }
}

/// Scheduler configuration command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigureCmd {
    pub num_cus: u32,
    pub num_slots: u32,
    /// Prefer polling over interrupts for completion detection.
    pub polling: bool,
    pub mode: ExecMode,
    /// CUs that run without host control; they are never marked valid.
    #[serde(default)]
    pub free_running: Vec<u32>,
}

impl ConfigureCmd {
    pub fn new(num_cus: u32, num_slots: u32, polling: bool, mode: ExecMode) -> Self {
        Self {
            num_cus,
            num_slots,
            polling,
            mode,
            free_running: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_cus == 0 || self.num_cus as usize > MAX_CUS {
            return Err(KdsError::InvalidCommand(format!(
                "num_cus {} outside 1..={}",
                self.num_cus, MAX_CUS
            )));
        }
        if self.num_slots == 0 || self.num_slots as usize > MAX_SLOTS {
            return Err(KdsError::InvalidCommand(format!(
                "num_slots {} outside 1..={}",
                self.num_slots, MAX_SLOTS
            )));
        }
        Ok(())
    }
}

/// One-time CU initialization with timeout budgets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitCuCmd {
    pub cu_mask: CuMask,
    /// Zero disables hang detection for these CUs.
    pub run_timeout: Duration,
    pub reset_timeout: Duration,
    pub regmap: Vec<u32>,
}

/// Start a CU with a consecutive register map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartCuCmd {
    pub cu_mask: CuMask,
    pub regmap: Vec<u32>,
}

/// Start a CU with a register map given as (offset, value) pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecWriteCmd {
    pub cu_mask: CuMask,
    pub pairs: Vec<(u32, u32)>,
}

/// Device-side buffer copy executed by the copy engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyBoCmd {
    pub src_handle: u32,
    pub dst_handle: u32,
    pub size: u64,
    pub src_offset: u64,
    pub dst_offset: u64,
}

/// Bring up or tear down a contiguous range of soft CUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkRangeCmd {
    pub start_cu: u32,
    pub num_cus: u32,
}

impl SkRangeCmd {
    pub fn range(&self) -> std::ops::Range<usize> {
        let start = self.start_cu as usize;
        start..start + self.num_cus as usize
    }
}

/// A command packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "opcode", rename_all = "snake_case")]
pub enum Command {
    Configure(ConfigureCmd),
    InitCu(InitCuCmd),
    StartCu(StartCuCmd),
    ExecWrite(ExecWriteCmd),
    CopyBo(CopyBoCmd),
    SkConfig(SkRangeCmd),
    SkStart(StartCuCmd),
    SkUnconfig(SkRangeCmd),
}

impl Command {
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::Configure(_) => Opcode::Configure,
            Command::InitCu(_) => Opcode::InitCu,
            Command::StartCu(_) => Opcode::StartCu,
            Command::ExecWrite(_) => Opcode::ExecWrite,
            Command::CopyBo(_) => Opcode::CopyBo,
            Command::SkConfig(_) => Opcode::SkConfig,
            Command::SkStart(_) => Opcode::SkStart,
            Command::SkUnconfig(_) => Opcode::SkUnconfig,
        }
    }

    /// CU mask of commands that run on a compute unit.
    pub fn cu_mask(&self) -> Option<&CuMask> {
        match self {
            Command::StartCu(cmd) | Command::SkStart(cmd) => Some(&cmd.cu_mask),
            Command::ExecWrite(cmd) => Some(&cmd.cu_mask),
            _ => None,
        }
    }

    pub fn start_cu(cu_mask: CuMask, regmap: Vec<u32>) -> Self {
        Command::StartCu(StartCuCmd { cu_mask, regmap })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        let terminal: Vec<_> = CmdState::ALL.into_iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(
            terminal,
            vec![
                CmdState::Completed,
                CmdState::Error,
                CmdState::Abort,
                CmdState::Timeout,
                CmdState::NoResponse
            ]
        );
    }

    #[test]
    fn state_u8_conversion() {
        for state in CmdState::ALL {
            assert_eq!(CmdState::from_u8(state.as_u8()), Some(state));
        }
        assert_eq!(CmdState::from_u8(7), None);
        assert_eq!(CmdState::from_u8(0), None);
    }

    #[test]
    fn cu_mask_from_indices() {
        let mask = CuMask::from_indices(&[0, 3, 33]).unwrap();
        assert_eq!(mask.words(), &[0b1001, 0b10]);
        assert!(mask.contains(33));
        assert!(!mask.contains(1));
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 3, 33]);
    }

    #[test]
    fn cu_mask_rejects_out_of_range() {
        assert!(CuMask::from_indices(&[MAX_CUS]).is_err());
        assert!(CuMask::from_words(vec![0; CU_MASK_WORDS + 1]).is_err());
    }

    #[test]
    fn empty_cu_mask() {
        assert!(CuMask::from_word(0).is_empty());
        assert!(CuMask::default().is_empty());
        assert!(!CuMask::from_word(0b10).is_empty());
    }

    #[test]
    fn configure_validation() {
        assert!(ConfigureCmd::new(2, 4, true, ExecMode::Software).validate().is_ok());
        assert!(ConfigureCmd::new(0, 4, true, ExecMode::Software).validate().is_err());
        assert!(ConfigureCmd::new(2, 129, true, ExecMode::Software).validate().is_err());
    }

    #[test]
    fn config_opcodes_take_no_cu() {
        let cfg = Command::Configure(ConfigureCmd::new(1, 1, true, ExecMode::Software));
        assert!(cfg.opcode().is_config());
        assert!(cfg.cu_mask().is_none());

        let start = Command::start_cu(CuMask::from_word(1), vec![]);
        assert!(!start.opcode().is_config());
        assert_eq!(start.cu_mask(), Some(&CuMask::from_word(1)));
    }
}
