use std::collections::HashSet;

use clap::Parser;

use crate::metadata::DEFAULT_EXCLUDED_NAMESPACES;

#[derive(Clone, Debug, Parser)]
#[command(name = "arbor", about = "Hierarchical namespace controller for Kubernetes")]
pub struct Settings {
    /// Address the health, debug and webhook server binds to.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub bind_addr: String,

    /// Workers per reconciler pool.
    #[arg(long, default_value_t = 8)]
    pub max_concurrent_reconciles: usize,

    /// Namespaces the controller must never manage. Repeatable; when given,
    /// replaces the built-in list. The controller's own namespace is always
    /// excluded.
    #[arg(long = "excluded-namespace")]
    pub excluded_namespaces: Vec<String>,

    /// The namespace this controller runs in.
    #[arg(long, default_value = "arbor-system")]
    pub namespace: String,

    /// Username the controller's own requests arrive as on the object
    /// webhook; its writes are exempt from copy protection.
    #[arg(
        long,
        default_value = "system:serviceaccount:arbor-system:arbor"
    )]
    pub service_account: String,
}

impl Settings {
    /// The effective excluded-namespace set.
    pub fn excluded(&self) -> HashSet<String> {
        let mut out: HashSet<String> = if self.excluded_namespaces.is_empty() {
            DEFAULT_EXCLUDED_NAMESPACES
                .iter()
                .map(|ns| (*ns).to_string())
                .collect()
        } else {
            self.excluded_namespaces.iter().cloned().collect()
        };
        out.insert(self.namespace.clone());
        out
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings::parse_from(["arbor"])
    }
}
