//! Operator tool: re-appends every dead letter of the configured topics to
//! its original stream so the worker pools process it again.

use durable::stream_for;
use log::*;
use service::{config::Config, logging::Logger};

#[tokio::main]
async fn main() {
    let config = Config::new();
    if let Err(e) = Logger::init_logger(&config) {
        eprintln!("Failed to initialize logger: {e}");
        std::process::exit(1);
    }

    let backend = match service::init_backend(&config).await {
        Ok(backend) => backend,
        Err(e) => {
            error!("Failed to connect to the event backend: {e}");
            std::process::exit(1);
        }
    };

    let mut replayed = 0;
    let mut failed = 0;
    for topic in &config.stream_topics {
        let stream = stream_for(&config.stream_prefix, topic);
        let dead_letters = match backend.event_log.dead_letters(&stream).await {
            Ok(dead_letters) => dead_letters,
            Err(e) => {
                error!("Failed to list dead letters for {stream}: {e}");
                std::process::exit(1);
            }
        };

        for dead in dead_letters {
            match backend.event_log.replay_dead_letter(&stream, &dead.id).await {
                Ok(entry_id) => {
                    info!(
                        "Replayed {} (entry {} failed {} time(s): {}) as {entry_id}",
                        dead.id, dead.entry_id, dead.delivery_count, dead.reason
                    );
                    replayed += 1;
                }
                Err(e) => {
                    warn!("Failed to replay {} on {stream}: {e}", dead.id);
                    failed += 1;
                }
            }
        }
    }

    info!("Replayed {replayed} dead letter(s), {failed} failure(s)");
    if failed > 0 {
        std::process::exit(1);
    }
}
