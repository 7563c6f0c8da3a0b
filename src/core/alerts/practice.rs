// Practice-mode delivery.
//
// Runs the same Sending -> Sent path as a live alert but reports success
// for every contact after a short simulated latency. Nothing in here can
// reach a delivery channel.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use super::machine::EngineEvent;
use super::model::SessionId;
use crate::core::model::ContactId;

/// Latency before each simulated delivery completes.
pub const SIMULATED_LATENCY: Duration = Duration::from_millis(750);

pub fn simulate_delivery(
    session: SessionId,
    contacts: Vec<ContactId>,
    latency: Duration,
    events: UnboundedSender<EngineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        for contact_id in contacts {
            tokio::time::sleep(latency).await;
            log::info!("[practice] Simulated alert delivered to contact {}", contact_id);
            if events
                .send(EngineEvent::SimulatedDelivery { session, contact_id })
                .is_err()
            {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_reports_each_contact_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        simulate_delivery(9, vec![ContactId(1), ContactId(2)], SIMULATED_LATENCY, tx)
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                EngineEvent::SimulatedDelivery {
                    session: 9,
                    contact_id: ContactId(1)
                },
                EngineEvent::SimulatedDelivery {
                    session: 9,
                    contact_id: ContactId(2)
                },
            ]
        );
    }
}
