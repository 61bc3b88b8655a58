//! Prints provisioning progress to stdout.

use gatebind_core::{ProvisionEvent, ProvisionObserver, StepStatus};

pub struct CliObserver;

impl ProvisionObserver for CliObserver {
    fn on_event(&self, event: &ProvisionEvent) {
        match event {
            ProvisionEvent::Step {
                step,
                status,
                device,
            } => {
                let marker = match status {
                    StepStatus::InProgress => "..",
                    StepStatus::Success => "ok",
                    StepStatus::Failed => "!!",
                };
                match (status, device) {
                    (StepStatus::Success, Some(d)) => println!("[{marker}] {step} ({})", d.mac),
                    _ => println!("[{marker}] {step}"),
                }
            }
            ProvisionEvent::StateChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "State");
            }
        }
    }
}
