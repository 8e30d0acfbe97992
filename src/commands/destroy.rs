//! `stackform destroy`

use crate::Context;
use crate::cli::DestroyArgs;
use crate::engine::executor;
use crate::ui;
use anyhow::Result;
use declarative::{CancelToken, ConfirmCallback};

pub fn run(ctx: &Context, args: &DestroyArgs) -> Result<bool> {
    let stack = super::load(ctx, Some(&args.run))?;
    let store = stack.open_state()?;
    if store.is_empty() {
        ui::info(&format!("Nothing recorded for stack '{}'", stack.name()));
        return Ok(true);
    }

    let change_set = stack.plan_destroy(&store)?;
    let provider = stack.connect()?;
    let cancel = CancelToken::new();
    executor::install_interrupt_handler(&cancel);

    let mut confirm = TypedName {
        expected: stack.name(),
        given: args.confirm.as_deref(),
    };
    let result = executor::run(
        &change_set,
        provider.as_ref(),
        &store,
        &stack.settings.execute_options(),
        super::run_options(ctx, false, false),
        &cancel,
        &mut confirm,
    )?;
    Ok(result.is_success())
}

/// Confirmation by typing the stack name
///
/// `given` comes from `--confirm`; without it the operator is prompted.
struct TypedName<'a> {
    expected: &'a str,
    given: Option<&'a str>,
}

impl ConfirmCallback for TypedName<'_> {
    fn confirm(&mut self, _prompt: &str) -> std::io::Result<bool> {
        let answer = match self.given {
            Some(given) => given.to_string(),
            None => dialoguer::Input::<String>::new()
                .with_prompt(format!(
                    "Type the stack name '{}' to delete every resource",
                    self.expected
                ))
                .interact_text()
                .map_err(|e| std::io::Error::other(e.to_string()))?,
        };
        if answer.trim() == self.expected {
            return Ok(true);
        }
        ui::error(&format!(
            "'{}' does not match stack name '{}'",
            answer.trim(),
            self.expected
        ));
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::local::SandboxProvider;
    use crate::engine::{RunOptions, RunResult};
    use crate::kinds;
    use declarative::{
        AutoConfirm, ExecuteOptions, ResourceDecl, ResourceGraph, StackDecl, StateStore,
        compute_change_set, plan_destroy,
    };

    fn applied(provider: &SandboxProvider) -> StateStore {
        let decl = StackDecl::new("web", "r")
            .resource(ResourceDecl::new("vpc", "network").property("cidr_block", "10.0.0.0/16"))
            .resource(
                ResourceDecl::new("assets", "storage_bucket").property("bucket_name", "assets"),
            );
        let catalog = kinds::catalog();
        let graph = ResourceGraph::build(decl, &catalog).unwrap();
        let store = StateStore::in_memory("web");
        let change_set = compute_change_set(&graph, &store.snapshot(), &catalog).unwrap();
        executor::run(
            &change_set,
            provider,
            &store,
            &ExecuteOptions::default(),
            quiet(),
            &CancelToken::new(),
            &mut AutoConfirm,
        )
        .unwrap();
        store
    }

    fn quiet() -> RunOptions {
        RunOptions {
            quiet: true,
            ..RunOptions::default()
        }
    }

    fn destroy(provider: &SandboxProvider, store: &StateStore, given: &str) -> RunResult {
        let change_set = plan_destroy(&store.snapshot()).unwrap();
        executor::run(
            &change_set,
            provider,
            store,
            &ExecuteOptions::default(),
            quiet(),
            &CancelToken::new(),
            &mut TypedName {
                expected: "web",
                given: Some(given),
            },
        )
        .unwrap()
    }

    #[test]
    fn mismatched_name_aborts_before_any_delete() {
        let provider = SandboxProvider::in_memory(0);
        let store = applied(&provider);
        assert_eq!(provider.object_count(), 2);

        let result = destroy(&provider, &store, "prod");
        assert!(matches!(result, RunResult::Aborted));
        assert!(!result.is_success());
        assert_eq!(provider.object_count(), 2);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn matching_name_deletes_everything() {
        let provider = SandboxProvider::in_memory(0);
        let store = applied(&provider);

        let result = destroy(&provider, &store, " web ");
        assert!(result.is_success());
        assert_eq!(provider.object_count(), 0);
        assert!(store.is_empty());
    }
}
