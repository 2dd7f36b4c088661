//! # CRD Generator
//!
//! Prints the CustomResourceDefinitions of `KeystoneAPI` and
//! `KeystoneService` as a multi-document YAML stream.
//!
//! ```bash
//! cargo run --bin crdgen > config/crd/keystone.yaml
//! cargo run --bin crdgen | kubectl apply -f -
//! ```

use keystone_operator::crd::{KeystoneAPI, KeystoneService};
use kube::core::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&KeystoneAPI::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&KeystoneService::crd())?);
    Ok(())
}
