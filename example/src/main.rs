use anyhow::Result;
use futures::future::join_all;
use joinflow::{FlowConfig, Orchestrator, Person, SimulatedServices, WorkerPool};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    // Optional config file as the first argument, defaults otherwise
    let config = match std::env::args().nth(1) {
        Some(path) => FlowConfig::load_file(&path)?,
        None => FlowConfig::default(),
    };
    info!("Running with {:?}", config);

    let pool = Arc::new(WorkerPool::new(config.pool_limits())?);
    let services = Arc::new(SimulatedServices::new().with_latency(5, 50));
    let orchestrator = Orchestrator::new(pool.clone(), services, config)?;

    let applicants = vec![
        Person::new("p-1", "Ada", 36),
        Person::new("p-2", "Edsger", 64),
        Person::new("p-3", "Barbara", 79),
        Person::new("p-4", "Ken", 21),
    ];

    let outcomes = join_all(
        applicants
            .iter()
            .map(|person| orchestrator.run_async(person.clone())),
    )
    .await;

    for (person, outcome) in applicants.iter().zip(outcomes) {
        match outcome {
            Ok(coverage) => println!("{}: {}", person.name, serde_json::to_string(&coverage)?),
            Err(e) => println!("{}: failed ({})", person.name, e),
        }
    }

    pool.shutdown();
    println!("{:#?}", orchestrator.stats());
    println!("{:#?}", pool.stats());

    Ok(())
}
