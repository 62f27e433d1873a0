//! Memory address type.

use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;

/// Strongly typed address in the dumped process's address space
///
/// This wrapper around `u64` keeps addresses apart from sizes, offsets and
/// counts, which all flow through the same code paths during graph
/// construction.
///
/// ## Example
///
/// ```rust
/// use heapdig_core::types::Address;
///
/// let addr = Address::from(0x1000);
/// let next_addr = addr + 0x100; // Add offset
/// assert_eq!(next_addr.value(), 0x1100);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(u64);

impl Address
{
    /// The null address (0x0)
    ///
    /// Pointer fields holding this value are skipped during traversal.
    pub const ZERO: Self = Address(0);

    /// Create a new address from a `u64` value
    ///
    /// This is equivalent to `Address::from(value)` but can be used in const contexts.
    ///
    /// ```rust
    /// use heapdig_core::types::Address;
    ///
    /// const HEAP_BASE: Address = Address::new(0xc000000000);
    /// assert_eq!(HEAP_BASE.value(), 0xc000000000);
    /// ```
    pub const fn new(value: u64) -> Self
    {
        Address(value)
    }

    /// Get the raw `u64` value of this address
    pub const fn value(self) -> u64
    {
        self.0
    }

    /// True for the null address
    pub const fn is_null(self) -> bool
    {
        self.0 == 0
    }

    /// Add an offset to this address, checking for overflow
    ///
    /// ```rust
    /// use heapdig_core::types::Address;
    ///
    /// let addr = Address::from(0x1000);
    /// assert_eq!(addr.checked_add(0x100), Some(Address::from(0x1100)));
    /// assert_eq!(addr.checked_add(u64::MAX), None); // Overflow
    /// ```
    pub fn checked_add(self, offset: u64) -> Option<Self>
    {
        self.0.checked_add(offset).map(Address)
    }

    /// Subtract an offset from this address, checking for underflow
    pub fn checked_sub(self, offset: u64) -> Option<Self>
    {
        self.0.checked_sub(offset).map(Address)
    }

    /// Add a signed offset, checking for overflow in either direction
    ///
    /// Stack slots are described relative to the canonical frame address
    /// with negative offsets, so this is the common way to place them.
    pub fn checked_offset(self, offset: i64) -> Option<Self>
    {
        self.0.checked_add_signed(offset).map(Address)
    }

    /// Add an offset to this address, saturating at the maximum value
    pub fn saturating_add(self, offset: u64) -> Self
    {
        Address(self.0.saturating_add(offset))
    }

    /// Distance in bytes from `base` to this address, if it is not below `base`
    pub fn offset_from(self, base: Address) -> Option<u64>
    {
        self.0.checked_sub(base.0)
    }
}

impl From<u64> for Address
{
    fn from(value: u64) -> Self
    {
        Address(value)
    }
}

impl From<Address> for u64
{
    fn from(address: Address) -> Self
    {
        address.0
    }
}

impl fmt::Display for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:016x}", self.0)
    }
}

impl fmt::LowerHex for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Parses `0x`-prefixed hexadecimal or plain decimal addresses.
///
/// ```rust
/// use heapdig_core::types::Address;
///
/// assert_eq!("0xc000010000".parse::<Address>().unwrap(), Address::new(0xc000010000));
/// assert_eq!("4096".parse::<Address>().unwrap(), Address::new(4096));
/// assert!("0xzz".parse::<Address>().is_err());
/// ```
impl FromStr for Address
{
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        let trimmed = s.trim();
        let value = match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16)?,
            None => trimmed.parse::<u64>()?,
        };
        Ok(Address(value))
    }
}

impl Add<u64> for Address
{
    type Output = Address;

    fn add(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for Address
{
    type Output = Address;

    fn sub(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_sub(rhs))
    }
}
