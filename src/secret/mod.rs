//! Secret lifecycle: records, the two-store vault and the expiry sweeper.

pub mod record;
pub mod sweeper;
pub mod vault;

pub use record::{is_valid_id, NewSecret, PayloadType, RevealedSecret, SecretRecord, MAX_ID_LEN};
pub use sweeper::{SweepReport, Sweeper};
pub use vault::{SecretVault, VaultOptions};
