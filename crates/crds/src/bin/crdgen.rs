//! Print the Gantry CRD manifests as a multi-document YAML stream.
//!
//! ```sh
//! cargo run -p crds --bin crdgen > deploy/crds.yaml
//! ```

use crds::{Certificate, Ingress};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    let manifests = [Ingress::crd(), Certificate::crd()];
    for crd in &manifests {
        print!("---\n{}", serde_yaml::to_string(crd)?);
    }
    Ok(())
}
