use bitcoin::{Amount, ScriptBuf, TxIn};
use std::time::{SystemTime, UNIX_EPOCH};

/// Coins a wallet picked for a funding transaction.
///
/// `input_value` is the sum over `inputs`; `change` is `input_value`
/// minus the requested target and fee, to be paid to `change_script`.
#[derive(Debug, Clone)]
pub struct CoinSelection {
    pub inputs: Vec<TxIn>,
    pub input_value: Amount,
    pub change: Amount,
    pub change_script: ScriptBuf,
}

/// Unix-seconds time source. Mockable so tests can jump past channel
/// expiry without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock set before the unix epoch")
            .as_secs()
    }
}
