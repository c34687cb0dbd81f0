use ruint::aliases::U256;

pub type Bit = bool;

/// Steps in the path of a full key.
pub const KEY_BITS: usize = 256;

/// A path from the root of the tree, most significant (first taken) bit
/// first.
#[derive(Copy, Clone, Default, Eq, Hash, PartialEq, Debug)]
pub struct Bits {
    /// The number of bits in this path.
    pub count: usize,
    /// Only the low `count` bits are meaningful, the first step of the path
    /// being the highest of them.
    pub packed: U256,
}

impl Bits {
    pub const fn empty() -> Self {
        Bits {
            count: 0,
            packed: U256::ZERO,
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Appends a step at the end of the path.
    pub fn push_bit(&mut self, bit: Bit) {
        assert!(self.count < KEY_BITS, "Path longer than a key");
        self.packed = (self.packed << 1usize) | U256::from(bit as u64);
        self.count += 1;
    }

    /// Removes and returns the last step of the path.
    pub fn pop_last(&mut self) -> Bit {
        assert!(!self.is_empty(), "Cannot pop from an empty path");
        let b = self.packed.bit(0);
        self.packed >>= 1;
        self.count -= 1;
        b
    }

    /// Step taken at depth `i`.
    pub fn get_bit(&self, i: usize) -> Bit {
        assert!(i < self.count, "Index out of bounds");
        self.packed.bit(self.count - 1 - i)
    }

    pub fn with_bit(&self, bit: Bit) -> Self {
        let mut x = *self;
        x.push_bit(bit);
        x
    }

    /// The first `n` steps of this path.
    pub fn prefix(&self, n: usize) -> Self {
        assert!(n <= self.count, "Prefix longer than path");
        Bits {
            count: n,
            packed: self.packed >> (self.count - n),
        }
    }
}
