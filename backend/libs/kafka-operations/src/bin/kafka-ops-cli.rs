use std::env;
use std::path::Path;

use kafka_operations::config::Settings;
use kafka_operations::telemetry::{init_tracing, LogFormat};
use kafka_operations::transport::kafka::{KafkaProducerClient, KafkaTopicAdmin};
use kafka_operations::transport::{ensure_topics, produce_operation};
use kafka_operations::OperationKind;
use tokio_util::sync::CancellationToken;

fn usage() -> ! {
    eprintln!("Usage:");
    eprintln!("  kafka-ops-cli ensure-topics [config.toml]");
    eprintln!("  kafka-ops-cli produce <topic> <Insert|Update|Delete> <key> <dto_json> [config.toml]");
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let format = env::var("LOG_FORMAT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(LogFormat::Plain);
    init_tracing(format)?;

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        usage();
    }

    match args[1].as_str() {
        "ensure-topics" if args.len() <= 3 => {
            let settings = Settings::load(args.get(2).map(Path::new))?;
            let admin = KafkaTopicAdmin::new(&settings.kafka)?;
            ensure_topics(&admin, &settings.topics).await?;
            println!("Ensured {} topics", settings.topics.len());
        }
        "produce" if (6..=7).contains(&args.len()) => {
            let settings = Settings::load(args.get(6).map(Path::new))?;
            let topic = &args[2];
            let operation: OperationKind = args[3].parse()?;
            let key = &args[4];
            let dto: serde_json::Value = serde_json::from_str(&args[5])?;

            let producer = KafkaProducerClient::new(&settings.kafka)?;
            produce_operation(
                &producer,
                topic,
                key,
                operation,
                &dto,
                &CancellationToken::new(),
            )
            .await?;
            println!("Produced {} to {} with key {}", operation, topic, key);
        }
        _ => usage(),
    }

    Ok(())
}
