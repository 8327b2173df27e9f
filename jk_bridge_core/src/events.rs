use std::time::Duration;

use tokio::sync::mpsc::Receiver;

/// Emits `emit()` every `interval`, starting one interval from now. The
/// timer stops once the receiving end is dropped.
#[allow(clippy::unused_async)]
pub async fn emit_on_timer<M: 'static + Send>(
    interval: Duration,
    emit: fn() -> M,
) -> Box<Receiver<M>> {
    let (tx, rx) = tokio::sync::mpsc::channel(1);

    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    tokio::task::spawn(async move {
        loop {
            interval.tick().await;
            if tx.send(emit()).await.is_err() {
                tracing::debug!("Timer receiver dropped. Exiting timer loop.");
                break;
            }
        }
    });

    Box::new(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn skips_the_immediate_tick() {
        let mut rx = emit_on_timer(Duration::from_secs(5), || 7u8).await;

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.try_recv().ok(), Some(7));
    }
}
