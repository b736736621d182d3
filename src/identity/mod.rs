// Identity module - Ed25519 keys and the notary's signing collaborator

mod keypair;
mod signer;

pub use keypair::*;
pub use signer::*;
