// cvm-crypto/src/types.rs

/// Block height on the host chain
pub type BlockHeight = u64;

/// Timestamp in Unix epoch seconds
pub type Timestamp = u64;

/// Gas limit/used
pub type Gas = u64;

/// Coin amount in base units (the host chain's satoshi-like unit)
pub type Amount = u64;

/// Base units per coin
pub const COIN: Amount = 100_000_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coin_unit() {
        assert_eq!(COIN, 100_000_000);
        let half: Amount = COIN / 2;
        assert_eq!(half * 2, COIN);
    }
}
