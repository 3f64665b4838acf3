use crate::commands::{load_config, open_pool, runtime, CommandFailure, CommandResult};
use expensa_db::{migrations, DemoSeedDataset, SeedResult};

pub fn run() -> CommandResult {
    let config = match load_config("seed") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime("seed") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = open_pool(&config).await?;

        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;

        let seed_result = DemoSeedDataset::load(&pool)
            .await
            .map_err(|error| ("seed_execution", error.to_string(), 5u8))?;

        let verification = DemoSeedDataset::verify(&pool)
            .await
            .map_err(|error| ("seed_verification", error.to_string(), 5u8))?;

        let run_result: Result<SeedResult, CommandFailure> = if verification.all_present {
            Ok(seed_result)
        } else {
            let failed: Vec<&str> = verification
                .checks
                .iter()
                .filter_map(|(check, passed)| (!passed).then_some(check.as_str()))
                .collect();
            Err(("seed_verification", verification_message(&failed), 6u8))
        };

        pool.close().await;
        run_result
    });

    match result {
        Ok(seeded) => CommandResult::success("seed", summary(&seeded)),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("seed", error_class, message, exit_code)
        }
    }
}

fn summary(seeded: &SeedResult) -> String {
    let flows: Vec<String> = DemoSeedDataset::flows()
        .iter()
        .map(|flow| format!("  - {}: {} ({} steps)", flow.id.0, flow.name, flow.steps.len()))
        .collect();
    format!(
        "demo dataset loaded: {} company, {} users, {} rules, {} flows\n{}",
        seeded.companies,
        seeded.users,
        seeded.rules,
        seeded.flows,
        flows.join("\n")
    )
}

fn verification_message(failed: &[&str]) -> String {
    if failed.is_empty() {
        "some seed data failed to load".to_string()
    } else {
        format!("seed verification failed for checks: {}", failed.join(", "))
    }
}
