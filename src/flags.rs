/// Typed bit sets for the `x_dns_flags`, `x_blocking_flags` and
/// `x_null_null_flags` wire fields.
///
/// Bit positions are part of the wire format and must not be reordered.
use std::fmt;
use std::marker::PhantomData;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub trait Flag: Copy + fmt::Debug + 'static {
    const ALL: &'static [Self];

    fn bit(self) -> u32;
}

pub struct FlagSet<F: Flag> {
    bits: u32,
    _marker: PhantomData<F>,
}

impl<F: Flag> FlagSet<F> {
    pub const fn empty() -> Self {
        Self {
            bits: 0,
            _marker: PhantomData,
        }
    }

    pub fn from_bits(bits: u32) -> Self {
        Self {
            bits,
            _marker: PhantomData,
        }
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn insert(&mut self, flag: F) {
        self.bits |= flag.bit();
    }

    pub fn contains(&self, flag: F) -> bool {
        self.bits & flag.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = F> + '_ {
        F::ALL.iter().copied().filter(|f| self.contains(*f))
    }
}

impl<F: Flag> Clone for FlagSet<F> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<F: Flag> Copy for FlagSet<F> {}

impl<F: Flag> Default for FlagSet<F> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<F: Flag> PartialEq for FlagSet<F> {
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits
    }
}

impl<F: Flag> Eq for FlagSet<F> {}

impl<F: Flag> fmt::Debug for FlagSet<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl<F: Flag> FromIterator<F> for FlagSet<F> {
    fn from_iter<I: IntoIterator<Item = F>>(iter: I) -> Self {
        let mut set = Self::empty();
        for flag in iter {
            set.insert(flag);
        }
        set
    }
}

impl<F: Flag> Serialize for FlagSet<F> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(i64::from(self.bits))
    }
}

impl<'de, F: Flag> Deserialize<'de> for FlagSet<F> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = i64::deserialize(deserializer)?;
        u32::try_from(raw)
            .map(Self::from_bits)
            .map_err(|_| serde::de::Error::custom(format!("flag field out of range: {raw}")))
    }
}

macro_rules! define_flags {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $shift:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl Flag for $name {
            const ALL: &'static [Self] = &[$(Self::$variant),+];

            fn bit(self) -> u32 {
                match self {
                    $(Self::$variant => 1 << $shift),+
                }
            }
        }
    };
}

define_flags! {
    /// DNS anomalies; several may hold at once.
    DnsFlag {
        Bogon = 0,
        UnexpectedFailure = 1,
        UnexpectedAddrs = 2,
        AsnMismatch = 3,
        ResolverIntercepted = 4,
    }
}

define_flags! {
    /// Evidence collected while choosing the blocking reason.
    BlockingFlag {
        Dns = 0,
        TcpIp = 1,
        Tls = 2,
        HttpFailure = 3,
        HttpDiff = 4,
        Success = 5,
    }
}

define_flags! {
    /// Rules of the undetermined-avoidance pass that fired.
    NullNullFlag {
        ExpectedDnsLookupFailure = 0,
        ExpectedTcpConnectFailure = 1,
        ExpectedTlsHandshakeFailure = 2,
        SuccessfulHttps = 3,
        AnomalyWithoutVerdict = 4,
    }
}

pub type DnsFlags = FlagSet<DnsFlag>;
pub type BlockingFlags = FlagSet<BlockingFlag>;
pub type NullNullFlags = FlagSet<NullNullFlag>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_positions_are_stable() {
        assert_eq!(DnsFlag::Bogon.bit(), 1);
        assert_eq!(DnsFlag::ResolverIntercepted.bit(), 16);
        assert_eq!(BlockingFlag::Success.bit(), 32);
        assert_eq!(NullNullFlag::AnomalyWithoutVerdict.bit(), 16);
    }

    #[test]
    fn multiple_causes_are_preserved() {
        let flags: DnsFlags = [DnsFlag::UnexpectedAddrs, DnsFlag::AsnMismatch]
            .into_iter()
            .collect();
        assert!(flags.contains(DnsFlag::UnexpectedAddrs));
        assert!(flags.contains(DnsFlag::AsnMismatch));
        assert!(!flags.contains(DnsFlag::Bogon));
        assert_eq!(flags.bits(), 0b1100);
        assert_eq!(
            flags.iter().collect::<Vec<_>>(),
            vec![DnsFlag::UnexpectedAddrs, DnsFlag::AsnMismatch]
        );
    }

    #[test]
    fn serializes_as_integer() {
        let mut flags = BlockingFlags::empty();
        flags.insert(BlockingFlag::TcpIp);
        flags.insert(BlockingFlag::HttpDiff);
        assert_eq!(serde_json::to_string(&flags).unwrap(), "18");
        let back: BlockingFlags = serde_json::from_str("18").unwrap();
        assert_eq!(back, flags);
        assert!(serde_json::from_str::<BlockingFlags>("-1").is_err());
    }
}
