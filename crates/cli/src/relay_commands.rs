use std::{io::Write, sync::Arc, time::Duration};

use {
    anyhow::Result,
    clap::Args,
    courier_config::{CourierConfig, validate},
    courier_queue::{Outcome, QueueRegistry, SendingContext},
    tokio::io::{AsyncBufReadExt, BufReader},
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

#[derive(Args)]
pub struct RelayArgs {
    /// Group the relayed destinations belong to.
    #[arg(long, default_value = "stdout")]
    group: String,

    /// Simulated per-message send latency in milliseconds.
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,

    /// Seconds to wait for pending messages on exit (overrides config).
    #[arg(long)]
    stop_timeout: Option<u64>,

    /// Print collected metrics to stderr on exit.
    #[cfg(feature = "metrics")]
    #[arg(long, default_value_t = false)]
    metrics: bool,
}

/// A message bound for one destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    destination: String,
    text: String,
}

/// One line of relay input.
///
/// `<destination> <text>` schedules a message. `/pause` blocks the group,
/// `/resume` releases it and `/retire <destination>` drains that destination's
/// queue and drops it, so the next message gets a fresh one.
#[derive(Debug, PartialEq, Eq)]
enum Line {
    Message(Message),
    Pause,
    Resume,
    Retire(String),
}

/// Outcome bookkeeping for a relay session.
///
/// Resolved outcomes are folded into counters and dropped, so only items
/// still in flight are held.
#[derive(Debug, Default)]
struct Tally {
    open: Vec<Outcome>,
    sent: usize,
    failed: usize,
    prune_at: usize,
}

impl Tally {
    /// Smallest backlog that triggers a prune.
    const PRUNE_FLOOR: usize = 1024;

    fn track(&mut self, outcome: Outcome) {
        self.open.push(outcome);
        if self.open.len() >= self.prune_at.max(Self::PRUNE_FLOOR) {
            self.prune();
            self.prune_at = self.open.len() * 2;
        }
    }

    fn prune(&mut self) {
        let (sent, failed) = (&mut self.sent, &mut self.failed);
        self.open.retain(|outcome| match outcome.try_result() {
            Some(true) => {
                *sent += 1;
                false
            },
            Some(false) => {
                *failed += 1;
                false
            },
            None => true,
        });
    }

    /// Final counts: sent, failed, unfinished.
    fn finish(mut self) -> (usize, usize, usize) {
        self.prune();
        (self.sent, self.failed, self.open.len())
    }
}

fn parse_line(line: &str) -> Option<Line> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let (head, rest) = match line.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (line, ""),
    };

    match (head, rest) {
        ("/pause", "") => Some(Line::Pause),
        ("/resume", "") => Some(Line::Resume),
        ("/retire", dest) if !dest.is_empty() => Some(Line::Retire(dest.to_string())),
        (_, "") => None,
        (dest, text) => Some(Line::Message(Message {
            destination: dest.to_string(),
            text: text.to_string(),
        })),
    }
}

pub async fn handle_relay(args: RelayArgs, config: &CourierConfig) -> Result<()> {
    let validation = validate(config);
    if validation.has_errors() {
        for d in &validation.diagnostics {
            warn!(path = d.path, severity = %d.severity, "{}", d.message);
        }
        anyhow::bail!("invalid configuration, run `courier config check` for details");
    }

    #[cfg(feature = "metrics")]
    let metrics = courier_metrics::init_metrics(courier_metrics::MetricsRecorderConfig {
        enabled: args.metrics,
        global_labels: Vec::new(),
    })?;

    let sending = &config.sending;
    let stop_timeout = args
        .stop_timeout
        .map_or_else(|| sending.stop_timeout(), Duration::from_secs);
    let context = SendingContext::from_config(sending)?;

    let delay = Duration::from_millis(args.delay_ms);
    let registry = Arc::new(
        QueueRegistry::blocking(&context, args.group.clone(), move |message: &Message| {
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            let mut out = std::io::stdout().lock();
            writeln!(out, "[{}] {}", message.destination, message.text)?;
            out.flush()
        })
        .with_ttl(sending.cache_ttl()),
    );

    let cancel = CancellationToken::new();
    let sweeper = registry.spawn_sweeper(sending.sweep_interval(), cancel.clone());

    info!(group = %args.group, "relaying stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tally = Tally::default();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                None
            },
        };
        let Some(line) = line else {
            break;
        };

        match parse_line(&line) {
            Some(Line::Message(message)) => {
                let queue = registry.get(&message.destination);
                tally.track(queue.schedule(message));
            },
            Some(Line::Pause) => {
                context.local_stop(&args.group, Duration::ZERO).await;
                info!(group = %args.group, "sending paused");
            },
            Some(Line::Resume) => {
                context.release_block(Some(&args.group));
                info!(group = %args.group, "sending resumed");
            },
            Some(Line::Retire(destination)) => {
                if registry.contains(&destination) {
                    let drain = registry.get(&destination).single_stop(stop_timeout).await;
                    registry.remove(&destination);
                    info!(destination = %destination, remaining = drain.remaining(), "queue retired");
                }
            },
            None => {},
        }
    }

    // A paused group would otherwise hold its items until their window runs out.
    context.release_block(Some(&args.group));
    let drain = registry.stop(stop_timeout).await;
    cancel.cancel();
    sweeper.await?;

    let (sent, failed, unfinished) = tally.finish();
    info!(
        sent,
        failed,
        unfinished,
        drained = drain.is_complete(),
        "relay finished"
    );

    #[cfg(feature = "metrics")]
    if args.metrics {
        eprint!("{}", metrics.render());
    }

    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    fn message(destination: &str, text: &str) -> Line {
        Line::Message(Message {
            destination: destination.to_string(),
            text: text.to_string(),
        })
    }

    #[rstest]
    #[case("chat-1 hello", Some(message("chat-1", "hello")))]
    #[case("  chat-1\thello world  ", Some(message("chat-1", "hello world")))]
    #[case("/pause", Some(Line::Pause))]
    #[case("/resume", Some(Line::Resume))]
    #[case("/retire chat-1", Some(Line::Retire("chat-1".to_string())))]
    #[case("/retire", None)]
    #[case("chat-1", None)]
    #[case("", None)]
    #[case("# comment", None)]
    fn parses_relay_lines(#[case] input: &str, #[case] expected: Option<Line>) {
        assert_eq!(parse_line(input), expected);
    }

    #[tokio::test]
    async fn tally_drops_resolved_outcomes() {
        let ctx = SendingContext::new();
        let queue =
            courier_queue::DeliveryQueue::blocking(&ctx, "stdout", "chat-1", |n: &usize| n % 10 != 0);

        let mut tally = Tally::default();
        let mut last = None;
        for n in 0..Tally::PRUNE_FLOOR * 3 {
            let outcome = queue.schedule(n);
            last = Some(outcome.clone());
            tally.track(outcome);
            if n % 256 == 255 {
                last.take().unwrap().await.unwrap();
            }
        }
        assert!(tally.open.len() < Tally::PRUNE_FLOOR * 3);

        assert!(queue.single_stop(Duration::from_secs(10)).await.is_complete());
        let (sent, failed, unfinished) = tally.finish();
        assert_eq!(unfinished, 0);
        assert_eq!(failed, Tally::PRUNE_FLOOR * 3 / 10 + 1);
        assert_eq!(sent + failed, Tally::PRUNE_FLOOR * 3);
    }
}
