//! Planner agent

use async_trait::async_trait;
use sdk::context::fields;
use sdk::{Agent, AgentError, AgentRole, Context, PatternMatch, PhaseResult, PlanOutcome};
use tracing::{info, warn};

use super::{ask_json, language, require_str, str_field, string_list, SIMILAR_LIMIT};
use crate::db::LearningRepository;
use crate::llm::LlmGateway;

const SYSTEM_PROMPT: &str = "You are a senior software engineer planning a small programming task. \
Reply with a single JSON object: {\"plan\": string, \"subtasks\": [string], \
\"dependencies\": [string], \"challenges\": [string]}. \
List only third-party packages in dependencies.";

pub struct PlannerAgent {
    gateway: LlmGateway,
    learning: Option<LearningRepository>,
}

impl PlannerAgent {
    pub fn new(gateway: LlmGateway, learning: Option<LearningRepository>) -> Self {
        Self { gateway, learning }
    }

    async fn similar_patterns(&self, description: &str) -> Vec<PatternMatch> {
        let Some(learning) = &self.learning else {
            return Vec::new();
        };
        match learning.find_similar_patterns(description, SIMILAR_LIMIT).await {
            Ok(patterns) => patterns,
            Err(e) => {
                warn!("Pattern lookup failed: {:#}", e);
                Vec::new()
            }
        }
    }
}

fn build_prompt(context: &Context, description: &str, goal: &str, patterns: &[PatternMatch]) -> String {
    let mut prompt = format!(
        "Task: {}\nGoal: {}\nLanguage: {}\nProblem type: {}\n",
        description,
        goal,
        language(context),
        context.problem_type().unwrap_or("general"),
    );

    if !patterns.is_empty() {
        prompt.push_str("\nPreviously successful solutions to similar tasks:\n");
        for pattern in patterns {
            let template: String = pattern.code_template.chars().take(600).collect();
            prompt.push_str(&format!(
                "- {} (success rate {:.0}%)\n{}\n",
                pattern.description,
                pattern.success_rate * 100.0,
                template
            ));
        }
    }
    prompt
}

/// Numbered or bulleted lines of a plan, used when the reply lists no subtasks
fn subtasks_from_plan(plan: &str) -> Vec<String> {
    plan.lines()
        .map(str::trim)
        .filter_map(|line| {
            let stripped = line
                .trim_start_matches(|c: char| c.is_ascii_digit())
                .trim_start_matches(['.', ')', '-', '*'])
                .trim();
            (stripped.len() < line.len() && !stripped.is_empty()).then(|| stripped.to_string())
        })
        .collect()
}

#[async_trait]
impl Agent for PlannerAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Planner
    }

    async fn execute(&self, context: &Context) -> Result<PhaseResult, AgentError> {
        let description = require_str(context, fields::TASK_DESCRIPTION)?;
        let goal = require_str(context, fields::GOAL)?;

        let patterns = self.similar_patterns(description).await;
        let prompt = build_prompt(context, description, goal, &patterns);

        let (reply, _) = ask_json(
            &self.gateway,
            self.role(),
            context.iteration(),
            SYSTEM_PROMPT,
            prompt,
        )
        .await?;

        let plan = str_field(&reply, "plan")
            .ok_or_else(|| AgentError::InvalidReply("planner reply has no plan".to_string()))?;
        let mut subtasks = string_list(&reply, "subtasks");
        if subtasks.is_empty() {
            subtasks = subtasks_from_plan(&plan);
        }

        info!(
            subtasks = subtasks.len(),
            patterns = patterns.len(),
            "Plan created"
        );

        Ok(PhaseResult::Planned(PlanOutcome {
            plan,
            subtasks,
            dependencies: string_list(&reply, "dependencies"),
            challenges: string_list(&reply, "challenges"),
            pattern_matches: patterns,
        }))
    }
}
