use anyhow::Result;
use clap::Parser;
use steelnet_trnr::{SteelNetTrainer, TrainingConfig};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = TrainingConfig::parse();

    let mut trainer = SteelNetTrainer::new(config)?;

    trainer.train()?;

    Ok(())
}
