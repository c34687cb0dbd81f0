use serde::{Deserialize, Serialize};

/// Account index reserved as the "exit" destination. A transaction sent to
/// this index withdraws funds from the rollup instead of moving them.
pub const EXIT_IDX: u64 = 0;

/// First index handed out to a real account.
pub const FIRST_ACCOUNT_IDX: u64 = 1;

/// Largest account index the state tree accepts. Off-chain records encode
/// indices on 32 bits.
pub const MAX_ACCOUNT_IDX: u64 = u32::MAX as u64;

/// Number of base-ledger blocks in a staking slot.
pub const DEFAULT_BLOCKS_PER_SLOT: u64 = 100;

/// Number of slots in a staking era.
pub const DEFAULT_SLOTS_PER_ERA: u64 = 20;

/// An operator registered during era `e` may forge from era `e +
/// OPERATOR_ACTIVATION_DELAY` on.
pub const OPERATOR_ACTIVATION_DELAY: u64 = 2;

/// Splits base-ledger block numbers into staking slots and eras, counted from
/// the block the rollup contracts were created in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EraClock {
    pub genesis_block: u64,
    pub blocks_per_slot: u64,
    pub slots_per_era: u64,
}

impl Default for EraClock {
    fn default() -> Self {
        Self {
            genesis_block: 0,
            blocks_per_slot: DEFAULT_BLOCKS_PER_SLOT,
            slots_per_era: DEFAULT_SLOTS_PER_ERA,
        }
    }
}

impl EraClock {
    pub const fn new(genesis_block: u64, blocks_per_slot: u64, slots_per_era: u64) -> Self {
        Self {
            genesis_block,
            blocks_per_slot,
            slots_per_era,
        }
    }

    /// Slot containing `block`. Blocks before genesis belong to slot 0.
    pub fn slot_of(&self, block: u64) -> u64 {
        block.saturating_sub(self.genesis_block) / self.blocks_per_slot.max(1)
    }

    /// Era containing `block`. Blocks before genesis belong to era 0.
    pub fn era_of(&self, block: u64) -> u64 {
        self.slot_of(block) / self.slots_per_era.max(1)
    }

    /// First block of `era`.
    pub fn era_start(&self, era: u64) -> u64 {
        self.genesis_block + era * self.slots_per_era * self.blocks_per_slot
    }
}

#[test]
fn test_slot_and_era_boundaries() {
    let clock = EraClock::new(1_000, 10, 5);
    assert_eq!(clock.slot_of(999), 0);
    assert_eq!(clock.slot_of(1_000), 0);
    assert_eq!(clock.slot_of(1_009), 0);
    assert_eq!(clock.slot_of(1_010), 1);
    assert_eq!(clock.era_of(1_049), 0);
    assert_eq!(clock.era_of(1_050), 1);
    assert_eq!(clock.era_start(3), 1_150);
    assert_eq!(clock.era_of(clock.era_start(7)), 7);
}

#[test]
fn test_era_clock_survives_serde() {
    let clock = EraClock::new(42, DEFAULT_BLOCKS_PER_SLOT, DEFAULT_SLOTS_PER_ERA);
    let json = serde_json::to_string(&clock).unwrap();
    assert_eq!(serde_json::from_str::<EraClock>(&json).unwrap(), clock);
}

#[test]
fn test_exit_sentinel_is_not_an_account() {
    assert!(EXIT_IDX < FIRST_ACCOUNT_IDX);
    assert!(FIRST_ACCOUNT_IDX <= MAX_ACCOUNT_IDX);
}
