pub mod path;
pub mod script;
pub mod xpub;

pub use path::DerivationPath;
pub use script::{script_hash, DerivedScript, ScriptDeriver, ScriptPurpose};
pub use xpub::ExtendedPublicKey;
