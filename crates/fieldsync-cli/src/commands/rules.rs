use fieldsync_core::models::{PriorityRule, RuleCondition, RuleId};
use fieldsync_core::SyncRuntime;

use crate::cli::RuleAddArgs;
use crate::commands::common::{json_or_text, parse_id, print_json};
use crate::error::CliError;

pub fn rule_from_args(args: RuleAddArgs) -> PriorityRule {
    let condition = RuleCondition::new(args.field, args.operator.into(), json_or_text(&args.value));
    PriorityRule::new(
        args.name,
        args.entity_type.into(),
        vec![condition],
        args.modifier,
        args.author,
    )
}

pub async fn run_rules_add(
    args: RuleAddArgs,
    as_json: bool,
    runtime: &SyncRuntime,
) -> Result<(), CliError> {
    let rule = runtime.queue().add_rule(rule_from_args(args)).await?;
    if as_json {
        return print_json(&rule);
    }

    println!("Added rule {} ({})", rule.name, rule.id);
    Ok(())
}

pub async fn run_rules_list(as_json: bool, runtime: &SyncRuntime) -> Result<(), CliError> {
    let rules = runtime.queue().list_rules().await?;
    if as_json {
        return print_json(&rules);
    }

    if rules.is_empty() {
        println!("No priority rules defined.");
        return Ok(());
    }
    for line in format_rule_lines(&rules) {
        println!("{line}");
    }
    Ok(())
}

pub fn format_rule_lines(rules: &[PriorityRule]) -> Vec<String> {
    rules
        .iter()
        .map(|rule| {
            let conditions = rule
                .conditions
                .iter()
                .map(|condition| {
                    format!("{} {} {}", condition.field, condition.operator, condition.value)
                })
                .collect::<Vec<_>>()
                .join(" OR ");
            format!(
                "{} [{}] {} {:+} {} when {conditions}",
                rule.id,
                if rule.is_active { "active" } else { "inactive" },
                rule.entity_type,
                rule.priority_modifier,
                rule.name,
            )
        })
        .collect()
}

pub async fn run_rules_set_active(
    id: &str,
    is_active: bool,
    runtime: &SyncRuntime,
) -> Result<(), CliError> {
    let rule_id: RuleId = parse_id("rule", id)?;
    runtime.queue().set_rule_active(&rule_id, is_active).await?;
    println!(
        "Rule {rule_id} {}",
        if is_active { "enabled" } else { "disabled" }
    );
    Ok(())
}
