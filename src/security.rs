//! Seed-key security access.

use crate::error::ProtocolError;
use crate::executor::CommandHandle;
use crate::pdu::services;
use tracing::{debug, info};

const REQUEST_SEED: u8 = 0x01;
const SEND_KEY: u8 = 0x02;

/// Derive the 16-bit key for a 16-bit seed: double-and-XOR the accumulator
/// 36 times starting from 0x9360, then mask to 16 bits.
pub fn calculate_key(seed: u16) -> u16 {
    let mut key: u32 = 0x9360;
    for _ in 0..0x24 {
        key = key.wrapping_mul(2) ^ u32::from(seed);
    }
    (key & 0xFFFF) as u16
}

/// Run the seed-key exchange. A zero (or absent) seed means security is
/// already open and no key is sent.
pub async fn unlock(handle: &CommandHandle) -> Result<(), ProtocolError> {
    let response = handle
        .execute(services::SECURITY_ACCESS, &[REQUEST_SEED])
        .await
        .map_err(wrap)?;

    // data[0] echoes the sub-function; the seed follows big-endian.
    let seed = response.data.get(1..).unwrap_or(&[]);
    if seed.len() < 2 {
        debug!("no seed returned, skipping key exchange");
        return Ok(());
    }
    if seed[0] == 0x00 && seed[1] == 0x00 {
        info!("security already unlocked (zero seed)");
        return Ok(());
    }

    let seed16 = u16::from_be_bytes([seed[0], seed[1]]);
    let key = calculate_key(seed16);
    debug!("seed 0x{:04X} -> key 0x{:04X}", seed16, key);

    handle
        .execute(
            services::SECURITY_ACCESS,
            &[SEND_KEY, (key >> 8) as u8, key as u8],
        )
        .await
        .map_err(wrap)?;

    info!("security access granted");
    Ok(())
}

fn wrap(err: ProtocolError) -> ProtocolError {
    ProtocolError::SecurityAccessFailed(Box::new(err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_deterministic() {
        let seed = 0x1B2A;
        assert_eq!(calculate_key(seed), calculate_key(seed));
    }

    #[test]
    fn zero_seed_maps_to_zero_key() {
        // 0x9360 doubled 36 times overflows entirely out of 32 bits.
        assert_eq!(calculate_key(0x0000), 0x0000);
    }

    #[test]
    fn distinct_seeds_give_distinct_keys() {
        assert_ne!(calculate_key(0x1B2A), calculate_key(0x1B2B));
    }

    #[test]
    fn key_fits_sixteen_bits() {
        for seed in [0x0001u16, 0x00FF, 0x8000, 0xFFFF] {
            let _ = calculate_key(seed); // masked by construction
            assert!(u32::from(calculate_key(seed)) <= 0xFFFF);
        }
    }
}
