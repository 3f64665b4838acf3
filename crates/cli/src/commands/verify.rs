use expensa_core::domain::expense::ExpenseId;
use expensa_core::ledger::{ApprovalStore, ChainSigner, StoreError, VerificationResult};
use expensa_db::SqlApprovalStore;

use crate::commands::{load_config, open_pool, runtime, CommandFailure, CommandResult};

pub fn run(expense_id: &str) -> CommandResult {
    let config = match load_config("verify") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime("verify") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let expense_id = ExpenseId(expense_id.to_string());
    let signer = ChainSigner::new(config.ledger.signing_key.clone());

    let result = runtime.block_on(async {
        let pool = open_pool(&config).await?;
        let snapshot = SqlApprovalStore::new(pool.clone()).load_ledger(&expense_id).await;
        pool.close().await;

        let snapshot = snapshot.map_err(|error| match error {
            StoreError::NotFound(_) => ("not_found", error.to_string(), 6u8),
            other => ("ledger_read", other.to_string(), 5u8),
        })?;
        Ok::<VerificationResult, CommandFailure>(signer.verify(&expense_id, &snapshot.entries))
    });

    let verification = match result {
        Ok(verification) => verification,
        Err((error_class, message, exit_code)) => {
            return CommandResult::failure("verify", error_class, message, exit_code);
        }
    };
    let data = serde_json::to_value(&verification).ok();

    if verification.valid {
        CommandResult::success_with_data(
            "verify",
            format!(
                "ledger for `{}` verified: {} entries",
                verification.expense_id, verification.verified_entries
            ),
            data,
        )
    } else {
        CommandResult::failure_with_data(
            "verify",
            "ledger_integrity",
            verification
                .failure_reason
                .clone()
                .unwrap_or_else(|| "ledger chain failed verification".to_string()),
            7,
            data,
        )
    }
}
