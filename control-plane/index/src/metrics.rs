use crate::ControlIndex;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};
use std::sync::Arc;

#[derive(Debug)]
struct Instrumented(Arc<ControlIndex>);

pub fn register(reg: &mut Registry, index: Arc<ControlIndex>) {
    reg.register_collector(Box::new(Instrumented(index)));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let counts = self.0.pdp().counts();
        let mut policy_encoder = encoder.encode_descriptor(
            "policies",
            "The number of access policies by tier and action",
            None,
            MetricType::Gauge,
        )?;
        for (tier, action, n) in [
            ("privileged", "deny", counts.privileged_deny),
            ("privileged", "allow", counts.privileged_allow),
            ("regular", "deny", counts.regular_deny),
            ("regular", "allow", counts.regular_allow),
        ] {
            let labels = vec![("tier", tier), ("action", action)];
            let gauge = ConstGauge::new(n as u32);
            gauge.encode(policy_encoder.encode_family(&labels)?)?;
        }

        let sizes = self.0.sizes();
        for (name, help, n) in [
            ("peers", "The number of reachable peers", sizes.peers),
            ("imports", "The number of registered imports", sizes.imports),
            ("exports", "The number of registered exports", sizes.exports),
        ] {
            let gauge_encoder = encoder.encode_descriptor(name, help, None, MetricType::Gauge)?;
            ConstGauge::new(n as u32).encode(gauge_encoder)?;
        }

        Ok(())
    }
}
