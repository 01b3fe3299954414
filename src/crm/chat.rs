use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tokio::sync::broadcast;

use leadboard_common::{
    ChatResult, ERROR_REPLY, FunctionOutcome, FunctionResult, Lead, LeadPatch, MessageRole,
    NewLead, ResultStatus, Stage,
};

use super::db::DbHandle;
use super::llm::{ChatMessage, ChatModel, FunctionSpec};
use super::models::ContextEntry;
use super::ws::{BoardEvent, UserEvent, publish};
use crate::errors::CrmError;

/// Title used for conversations created before their first message.
pub const UNTITLED_CHAT: &str = "New Chat";

const TITLE_MAX_CHARS: usize = 50;
const SEARCH_LIMIT: usize = 5;

fn model_error(err: anyhow::Error) -> CrmError {
    CrmError::Model(format!("{:#}", err))
}

/// One user message to process.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub user_id: i64,
    pub session_token: String,
    pub conversation_id: Option<i64>,
    pub message: String,
}

/// The CRM assistant: builds the prompt, runs function calls against the
/// caller's leads, and records the exchange.
pub struct ChatService {
    db: DbHandle,
    model: Arc<dyn ChatModel>,
    events: broadcast::Sender<UserEvent>,
    context_messages: usize,
}

impl ChatService {
    pub fn new(
        db: DbHandle,
        model: Arc<dyn ChatModel>,
        events: broadcast::Sender<UserEvent>,
        context_messages: usize,
    ) -> Self {
        Self {
            db,
            model,
            events,
            context_messages,
        }
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Process one message end to end.
    ///
    /// Model failures produce an `Ok` result with `status: error` and the
    /// apology text; only storage failures surface as `Err`.
    pub async fn process_message(&self, turn: &ChatTurn) -> Result<ChatResult> {
        let user_id = turn.user_id;
        let token = turn.session_token.clone();
        let (leads, context) = self
            .db
            .call(move |db| Ok((db.list_leads(user_id)?, db.get_chat_context(&token)?)))
            .await
            .context("Failed to load assistant context")?;

        let mut messages = Vec::with_capacity(context.len() + 2);
        messages.push(ChatMessage::system(system_prompt(&leads)?));
        messages.extend(
            context
                .iter()
                .map(|entry| ChatMessage::text(&entry.role, entry.content.clone())),
        );
        messages.push(ChatMessage::user(turn.message.clone()));

        let result = match self.converse(user_id, messages, &leads).await {
            Ok((ai_message, function_results)) => ChatResult {
                ai_message,
                function_results,
                status: ResultStatus::Success,
                error: None,
            },
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Assistant model call failed");
                ChatResult {
                    ai_message: ERROR_REPLY.to_string(),
                    function_results: Vec::new(),
                    status: ResultStatus::Error,
                    error: Some(e.to_string()),
                }
            }
        };

        self.record(turn, &result).await?;
        Ok(result)
    }

    /// One model call with functions; if the model asks for a function, run
    /// it and make a second call for the final text.
    async fn converse(
        &self,
        user_id: i64,
        mut messages: Vec<ChatMessage>,
        leads: &[Lead],
    ) -> Result<(String, Vec<FunctionResult>)> {
        let functions = function_specs();
        let reply = self
            .model
            .complete(&messages, &functions)
            .await
            .map_err(model_error)?;

        let Some(call) = reply.function_call else {
            return Ok((reply.content.unwrap_or_default(), Vec::new()));
        };

        let arguments: Value = if call.arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&call.arguments)
                .with_context(|| format!("Model sent malformed arguments for {}", call.name))?
        };
        tracing::info!(user_id, function = %call.name, "Assistant requested function call");
        let outcome = self
            .execute_function_call(user_id, &call.name, &arguments, leads)
            .await;

        let outcome_json =
            serde_json::to_string(&outcome).context("Failed to serialize function outcome")?;
        messages.push(ChatMessage::assistant_call(call.clone()));
        messages.push(ChatMessage::function(call.name.clone(), outcome_json));

        let final_reply = self
            .model
            .complete(&messages, &[])
            .await
            .map_err(model_error)?;
        let results = vec![FunctionResult {
            function: call.name,
            arguments,
            result: outcome,
        }];
        Ok((final_reply.content.unwrap_or_default(), results))
    }

    /// Store the assistant reply in the conversation and, on success, extend
    /// the session's replay context.
    async fn record(&self, turn: &ChatTurn, result: &ChatResult) -> Result<()> {
        let conversation_id = turn.conversation_id;
        let token = turn.session_token.clone();
        let keep = self.context_messages;
        let user_message = turn.message.clone();
        let reply = result.ai_message.clone();
        let function_results = result.function_results.clone();
        let succeeded = result.status == ResultStatus::Success;
        self.db
            .call(move |db| {
                if let Some(id) = conversation_id {
                    db.add_message(id, MessageRole::Assistant, &reply, Some(&function_results))?;
                }
                if succeeded {
                    db.push_chat_context(
                        &token,
                        &[ContextEntry::user(user_message), ContextEntry::assistant(reply)],
                        keep,
                    )?;
                }
                Ok(())
            })
            .await
            .context("Failed to record assistant reply")
    }

    /// Run one assistant function against the caller's leads. Never fails:
    /// errors are reported in the outcome so the model can explain them.
    pub async fn execute_function_call(
        &self,
        user_id: i64,
        name: &str,
        arguments: &Value,
        leads: &[Lead],
    ) -> FunctionOutcome {
        let outcome = match name {
            "search_leads" => Ok(search_leads(arguments, leads)),
            "update_lead_status" => self.update_lead_status(user_id, arguments).await,
            "update_lead_data" => self.update_lead_data(user_id, arguments).await,
            "create_lead" => self.create_lead(user_id, arguments).await,
            "delete_lead" => self.delete_lead(user_id, arguments).await,
            other => Ok(FunctionOutcome::failed(format!("Unknown function: {}", other))),
        };
        outcome.unwrap_or_else(|e| {
            tracing::warn!(user_id, function = name, error = %e, "Assistant function failed");
            FunctionOutcome::failed(format!("Error executing {}: {}", name, e))
        })
    }

    async fn update_lead_status(&self, user_id: i64, args: &Value) -> Result<FunctionOutcome> {
        let Some(lead_id) = lead_id_arg(args) else {
            return Ok(FunctionOutcome::failed("lead_id is required"));
        };
        let raw = args.get("new_status").and_then(Value::as_str).unwrap_or_default();
        let stage: Stage = match raw.parse() {
            Ok(stage) => stage,
            Err(e) => return Ok(FunctionOutcome::failed(format!("{}", e))),
        };

        let moved = self
            .db
            .call(move |db| {
                let Some(current) = db.get_lead(user_id, lead_id)? else {
                    return Ok(None);
                };
                let patch = LeadPatch {
                    status: Some(stage),
                    ..LeadPatch::default()
                };
                Ok(db
                    .update_lead(user_id, lead_id, &patch)?
                    .map(|lead| (current.status, lead)))
            })
            .await?;

        let Some((from_status, lead)) = moved else {
            return Ok(FunctionOutcome::failed("Lead not found"));
        };
        publish(
            &self.events,
            user_id,
            BoardEvent::LeadMoved {
                lead_id,
                from_status,
                to_status: lead.status,
                card_order: lead.card_order,
            },
        );
        Ok(FunctionOutcome::ok(
            format!("Lead status updated to '{}'", stage),
            Some(serde_json::to_value(&lead)?),
        ))
    }

    async fn update_lead_data(&self, user_id: i64, args: &Value) -> Result<FunctionOutcome> {
        let Some(lead_id) = lead_id_arg(args) else {
            return Ok(FunctionOutcome::failed("lead_id is required"));
        };
        let field = args.get("field").and_then(Value::as_str).unwrap_or_default();
        let value = match args.get("value") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };

        let mut patch = LeadPatch::default();
        match field {
            "name" => patch.name = Some(value.clone()),
            "company" => patch.company = Some(value.clone()),
            "email" => patch.email = Some(value.clone()),
            "phone" => patch.phone = Some(value.clone()),
            "notes" => patch.notes = Some(value.clone()),
            "source" => patch.source = Some(value.clone()),
            "value" => match value.trim().parse::<f64>() {
                Ok(amount) => patch.value = Some(amount),
                Err(_) => {
                    return Ok(FunctionOutcome::failed(
                        "Invalid value format for lead value field",
                    ));
                }
            },
            other => return Ok(FunctionOutcome::failed(format!("Unknown field: {}", other))),
        }

        let updated = self
            .db
            .call(move |db| db.update_lead(user_id, lead_id, &patch))
            .await?;
        let Some(lead) = updated else {
            return Ok(FunctionOutcome::failed("Lead not found"));
        };
        publish(&self.events, user_id, BoardEvent::LeadUpdated { lead: lead.clone() });
        Ok(FunctionOutcome::ok(
            format!("Lead {} updated to '{}'", field, value),
            Some(serde_json::to_value(&lead)?),
        ))
    }

    async fn create_lead(&self, user_id: i64, args: &Value) -> Result<FunctionOutcome> {
        let new_lead: NewLead = match serde_json::from_value(args.clone()) {
            Ok(lead) => lead,
            Err(e) => return Ok(FunctionOutcome::failed(format!("Invalid lead data: {}", e))),
        };
        if new_lead.name.trim().is_empty() {
            return Ok(FunctionOutcome::failed("Lead name is required"));
        }
        let lead = self
            .db
            .call(move |db| db.create_lead(user_id, &new_lead))
            .await?;
        publish(&self.events, user_id, BoardEvent::LeadCreated { lead: lead.clone() });
        Ok(FunctionOutcome::ok(
            format!("New lead '{}' created successfully", lead.name),
            Some(serde_json::to_value(&lead)?),
        ))
    }

    /// Deletion is two-step: without `confirmed: true` the lead is only
    /// described back so the assistant can ask the user first.
    async fn delete_lead(&self, user_id: i64, args: &Value) -> Result<FunctionOutcome> {
        let Some(lead_id) = lead_id_arg(args) else {
            return Ok(FunctionOutcome::failed("Lead not found"));
        };
        let confirmed = args
            .get("confirmed")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let Some(lead) = self
            .db
            .call(move |db| db.get_lead(user_id, lead_id))
            .await?
        else {
            return Ok(FunctionOutcome::failed("Lead not found"));
        };

        if !confirmed {
            return Ok(FunctionOutcome {
                success: true,
                message: format!(
                    "Deleting lead '{}' cannot be undone. Ask the user to confirm, then call delete_lead again with confirmed set to true.",
                    lead.name
                ),
                data: Some(serde_json::to_value(&lead)?),
                requires_confirmation: true,
            });
        }

        let deleted = self
            .db
            .call(move |db| db.delete_lead(user_id, lead_id))
            .await?;
        if !deleted {
            return Ok(FunctionOutcome::failed("Failed to delete lead"));
        }
        publish(&self.events, user_id, BoardEvent::LeadDeleted { lead_id });
        Ok(FunctionOutcome::ok(
            format!("Lead '{}' deleted successfully", lead.name),
            None,
        ))
    }
}

// ── Prompt and functions ─────────────────────────────────────────────

pub fn system_prompt(leads: &[Lead]) -> Result<String> {
    let stages: Vec<String> = Stage::ALL.iter().map(|s| format!("- {}", s)).collect();
    let leads_json =
        serde_json::to_string_pretty(leads).context("Failed to serialize leads for the prompt")?;
    Ok(format!(
        "You are a CRM assistant. You help manage leads in a Kanban board with these statuses:
{}

Available leads: {}

You can:
1. Search for leads by name, company, or email
2. Update lead status (move between Kanban columns)
3. Update lead data (name, company, email, phone, value, notes, source)
4. Create new leads with provided information
5. Delete leads (ask for confirmation first, then call delete_lead with confirmed set to true)

Be formal but brief in responses. When referencing leads from conversation context, use smart matching to identify the correct lead.",
        stages.join("\n"),
        leads_json
    ))
}

/// The function schemas advertised to the model.
pub fn function_specs() -> Vec<FunctionSpec> {
    let stages: Vec<&str> = Stage::ALL.iter().map(Stage::as_str).collect();
    vec![
        FunctionSpec {
            name: "search_leads".into(),
            description: "Search for leads by name, company, or email".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Search query (name, company, or email)"}
                },
                "required": ["query"]
            }),
        },
        FunctionSpec {
            name: "update_lead_status".into(),
            description: "Update the status of a lead".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "lead_id": {"type": "string", "description": "ID of the lead to update"},
                    "new_status": {"type": "string", "enum": stages, "description": "New status for the lead"}
                },
                "required": ["lead_id", "new_status"]
            }),
        },
        FunctionSpec {
            name: "update_lead_data".into(),
            description: "Update specific data fields of a lead".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "lead_id": {"type": "string", "description": "ID of the lead to update"},
                    "field": {
                        "type": "string",
                        "enum": ["name", "company", "email", "phone", "value", "notes", "source"],
                        "description": "Field to update"
                    },
                    "value": {"type": "string", "description": "New value for the field"}
                },
                "required": ["lead_id", "field", "value"]
            }),
        },
        FunctionSpec {
            name: "create_lead".into(),
            description: "Create a new lead with provided information".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "description": "Lead's name"},
                    "company": {"type": "string", "description": "Company name"},
                    "email": {"type": "string", "description": "Email address"},
                    "phone": {"type": "string", "description": "Phone number"},
                    "value": {"type": "number", "description": "Lead value in dollars"},
                    "notes": {"type": "string", "description": "Additional notes"},
                    "source": {"type": "string", "description": "Lead source"},
                    "status": {"type": "string", "enum": stages, "description": "Initial status (defaults to Interest)"}
                },
                "required": ["name"]
            }),
        },
        FunctionSpec {
            name: "delete_lead".into(),
            description: "Delete a lead. Call without confirmed first; call again with confirmed=true only after the user agrees.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "lead_id": {"type": "string", "description": "ID of the lead to delete"},
                    "confirmed": {"type": "boolean", "description": "True once the user has confirmed the deletion"}
                },
                "required": ["lead_id"]
            }),
        },
    ]
}

// ── Matching ─────────────────────────────────────────────────────────

/// Leads matching `query`, best first.
///
/// Case-insensitive substring scoring: name 70 (plus 20 when the name starts
/// with the query), company 20, email 10. Non-matching leads are dropped and
/// ties keep board order.
pub fn find_matching_leads<'a>(query: &str, leads: &'a [Lead]) -> Vec<&'a Lead> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<(u32, &Lead)> = leads
        .iter()
        .filter_map(|lead| {
            let mut score = 0;
            let name = lead.name.to_lowercase();
            if name.contains(&needle) {
                score += 70;
                if name.starts_with(&needle) {
                    score += 20;
                }
            }
            if contains_ci(lead.company.as_deref(), &needle) {
                score += 20;
            }
            if contains_ci(lead.email.as_deref(), &needle) {
                score += 10;
            }
            (score > 0).then_some((score, lead))
        })
        .collect();
    // sort_by is stable
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.into_iter().map(|(_, lead)| lead).collect()
}

fn contains_ci(haystack: Option<&str>, needle: &str) -> bool {
    haystack.is_some_and(|h| h.to_lowercase().contains(needle))
}

fn search_leads(args: &Value, leads: &[Lead]) -> FunctionOutcome {
    let query = args.get("query").and_then(Value::as_str).unwrap_or_default();
    let matches = find_matching_leads(query, leads);
    let top: Vec<&Lead> = matches.iter().take(SEARCH_LIMIT).copied().collect();
    FunctionOutcome::ok(
        format!("Found {} matching leads", matches.len()),
        serde_json::to_value(top).ok(),
    )
}

/// Lead ids arrive as strings per the schema, but models also send numbers.
fn lead_id_arg(args: &Value) -> Option<i64> {
    match args.get("lead_id")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// ── Titles ───────────────────────────────────────────────────────────

/// Conversation title from a first message: its first line with whitespace
/// collapsed, cut at 50 characters with an ellipsis.
pub fn generate_title(message: &str) -> String {
    let first_line = message
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default();
    let collapsed = first_line.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return "New Conversation".to_string();
    }
    if collapsed.chars().count() <= TITLE_MAX_CHARS {
        return collapsed;
    }
    let cut: String = collapsed.chars().take(TITLE_MAX_CHARS).collect();
    format!("{}...", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::db::CrmDb;
    use crate::crm::llm::ModelReply;
    use crate::crm::llm::testing::ScriptedModel;
    use crate::crm::models::NewUser;

    struct Fixture {
        service: ChatService,
        model: Arc<ScriptedModel>,
        db: DbHandle,
        user_id: i64,
        conversation_id: i64,
        events: broadcast::Receiver<UserEvent>,
    }

    fn fixture(replies: Vec<Result<ModelReply, String>>) -> Fixture {
        let db = CrmDb::new_in_memory().unwrap();
        let user = db
            .create_user(&NewUser {
                email: "ada@example.com".into(),
                password_hash: "x".into(),
                ..NewUser::default()
            })
            .unwrap();
        db.create_session("tok", user.id, 1).unwrap();
        let conversation = db.create_conversation(user.id, "Chat").unwrap();
        let db = DbHandle::new(db);
        let model = Arc::new(ScriptedModel::new(replies));
        let (tx, rx) = broadcast::channel(16);
        let service = ChatService::new(db.clone(), model.clone(), tx, 10);
        Fixture {
            service,
            model,
            db,
            user_id: user.id,
            conversation_id: conversation.id,
            events: rx,
        }
    }

    fn turn(f: &Fixture, message: &str) -> ChatTurn {
        ChatTurn {
            user_id: f.user_id,
            session_token: "tok".into(),
            conversation_id: Some(f.conversation_id),
            message: message.into(),
        }
    }

    fn seed(f: &Fixture, lead: NewLead) -> Lead {
        f.db.lock_sync().unwrap().create_lead(f.user_id, &lead).unwrap()
    }

    fn lead(id: i64, name: &str, company: Option<&str>, email: Option<&str>) -> Lead {
        Lead {
            id,
            user_id: 1,
            name: name.into(),
            company: company.map(String::from),
            email: email.map(String::from),
            phone: None,
            value: None,
            notes: None,
            status: Stage::Interest,
            source: None,
            card_order: id,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_find_matching_leads_scoring() {
        let leads = vec![
            lead(1, "Bob Smith", Some("Acme"), None),
            lead(2, "Acme Buyer", None, None),
            lead(3, "Carol", None, Some("carol@acme.io")),
            lead(4, "Dave", Some("Globex"), None),
            lead(5, "Team Acme", None, None),
        ];
        let ids: Vec<i64> = find_matching_leads("ACME", &leads).iter().map(|l| l.id).collect();
        // prefix name (90), name (70), company (20), email (10)
        assert_eq!(ids, vec![2, 5, 1, 3]);
    }

    #[test]
    fn test_find_matching_leads_ties_keep_order() {
        let leads = vec![lead(1, "Ann Lee", None, None), lead(2, "Jo Lee", None, None)];
        let ids: Vec<i64> = find_matching_leads("lee", &leads).iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(find_matching_leads("", &leads).is_empty());
        assert!(find_matching_leads("zzz", &leads).is_empty());
    }

    #[test]
    fn test_search_leads_caps_results_but_counts_all() {
        let leads: Vec<Lead> = (1..=7).map(|i| lead(i, &format!("Lead {}", i), None, None)).collect();
        let outcome = search_leads(&json!({"query": "lead"}), &leads);
        assert!(outcome.success);
        assert_eq!(outcome.message, "Found 7 matching leads");
        assert_eq!(outcome.data.unwrap().as_array().unwrap().len(), 5);
    }

    #[test]
    fn test_generate_title() {
        assert_eq!(generate_title("Find   Acme\nand more"), "Find Acme");
        assert_eq!(generate_title("\n\n  hello  "), "hello");
        assert_eq!(generate_title("   "), "New Conversation");
        let long = "a".repeat(80);
        let title = generate_title(&long);
        assert_eq!(title, format!("{}...", "a".repeat(50)));
    }

    #[test]
    fn test_lead_id_arg_accepts_strings_and_numbers() {
        assert_eq!(lead_id_arg(&json!({"lead_id": "12"})), Some(12));
        assert_eq!(lead_id_arg(&json!({"lead_id": 12})), Some(12));
        assert_eq!(lead_id_arg(&json!({"lead_id": "abc"})), None);
        assert_eq!(lead_id_arg(&json!({})), None);
    }

    #[test]
    fn test_function_specs_cover_all_functions() {
        let names: Vec<String> = function_specs().into_iter().map(|f| f.name).collect();
        assert_eq!(
            names,
            vec!["search_leads", "update_lead_status", "update_lead_data", "create_lead", "delete_lead"]
        );
    }

    #[test]
    fn test_system_prompt_lists_stages_and_leads() {
        let prompt = system_prompt(&[lead(1, "Wile", Some("Acme"), None)]).unwrap();
        assert!(prompt.contains("- Meeting booked"));
        assert!(prompt.contains("\"Wile\""));
    }

    #[tokio::test]
    async fn test_plain_reply_records_context_and_message() {
        let f = fixture(vec![Ok(ModelReply::text("Hello there."))]);
        let result = f.service.process_message(&turn(&f, "Hi")).await.unwrap();
        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.ai_message, "Hello there.");
        assert!(result.function_results.is_empty());
        assert_eq!(f.model.request_count(), 1);

        let conv = f.conversation_id;
        let (messages, context) = f
            .db
            .call(move |db| Ok((db.list_messages(conv)?, db.get_chat_context("tok")?)))
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::Assistant);
        assert_eq!(context, vec![ContextEntry::user("Hi"), ContextEntry::assistant("Hello there.")]);
    }

    #[tokio::test]
    async fn test_context_is_replayed_on_next_turn() {
        let f = fixture(vec![Ok(ModelReply::text("First")), Ok(ModelReply::text("Second"))]);
        f.service.process_message(&turn(&f, "one")).await.unwrap();
        f.service.process_message(&turn(&f, "two")).await.unwrap();

        let requests = f.model.requests.lock().unwrap();
        let (messages, functions) = &requests[1];
        assert_eq!(*functions, 5);
        let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(messages[2].content.as_deref(), Some("First"));
    }

    #[tokio::test]
    async fn test_function_call_makes_second_model_call() {
        let mut f = fixture(vec![
            Ok(ModelReply::call("create_lead", json!({"name": "Road Runner", "value": "250"}))),
            Ok(ModelReply::text("Created Road Runner.")),
        ]);
        let result = f.service.process_message(&turn(&f, "Add Road Runner")).await.unwrap();
        assert_eq!(result.ai_message, "Created Road Runner.");
        assert_eq!(result.function_results.len(), 1);
        let call = &result.function_results[0];
        assert_eq!(call.function, "create_lead");
        assert!(call.result.success);
        assert!(result.modified_leads());

        {
            let requests = f.model.requests.lock().unwrap();
            assert_eq!(requests.len(), 2);
            let (messages, functions) = &requests[1];
            assert_eq!(*functions, 0, "final call is text-only");
            let last = messages.last().unwrap();
            assert_eq!(last.role, "function");
            assert_eq!(last.name.as_deref(), Some("create_lead"));
        }

        let user_id = f.user_id;
        let leads = f.db.call(move |db| db.list_leads(user_id)).await.unwrap();
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].value, Some(250.0));
        assert_eq!(leads[0].status, Stage::Interest);

        match f.events.try_recv().unwrap().event {
            BoardEvent::LeadCreated { lead } => assert_eq!(lead.name, "Road Runner"),
            other => panic!("Expected LeadCreated, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_model_error_yields_apology_result() {
        let f = fixture(vec![Err("rate limited".into())]);
        let result = f.service.process_message(&turn(&f, "Hi")).await.unwrap();
        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(result.ai_message, ERROR_REPLY);
        assert_eq!(
            result.error.as_deref(),
            Some("Assistant model error: rate limited")
        );

        let context = f.db.call(|db| db.get_chat_context("tok")).await.unwrap();
        assert!(context.is_empty(), "failed turns are not replayed");
    }

    #[tokio::test]
    async fn test_malformed_arguments_are_a_model_error() {
        let f = fixture(vec![Ok(ModelReply {
            content: None,
            function_call: Some(crate::crm::llm::FunctionCall {
                name: "search_leads".into(),
                arguments: "{not json".into(),
            }),
        })]);
        let result = f.service.process_message(&turn(&f, "Find")).await.unwrap();
        assert_eq!(result.status, ResultStatus::Error);
    }

    #[tokio::test]
    async fn test_update_lead_status_moves_to_end_of_column() {
        let mut f = fixture(vec![]);
        seed(&f, NewLead { status: Some(Stage::ClosedWin), ..NewLead::named("Existing") });
        let target = seed(&f, NewLead::named("Mover"));
        let args = json!({"lead_id": target.id.to_string(), "new_status": "Closed win"});
        let outcome = f.service.execute_function_call(f.user_id, "update_lead_status", &args, &[]).await;
        assert!(outcome.success, "{}", outcome.message);
        assert_eq!(outcome.message, "Lead status updated to 'Closed win'");
        assert_eq!(outcome.data.unwrap()["card_order"], 2);

        match f.events.try_recv().unwrap().event {
            BoardEvent::LeadMoved { from_status, to_status, .. } => {
                assert_eq!(from_status, Stage::Interest);
                assert_eq!(to_status, Stage::ClosedWin);
            }
            other => panic!("Expected LeadMoved, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_lead_status_rejects_unknown_stage() {
        let f = fixture(vec![]);
        let target = seed(&f, NewLead::named("Mover"));
        let args = json!({"lead_id": target.id, "new_status": "Won"});
        let outcome = f.service.execute_function_call(f.user_id, "update_lead_status", &args, &[]).await;
        assert!(!outcome.success);
        assert!(outcome.message.contains("Won"));
    }

    #[tokio::test]
    async fn test_update_lead_data_parses_value() {
        let f = fixture(vec![]);
        let target = seed(&f, NewLead::named("Wile"));
        let ok = f
            .service
            .execute_function_call(
                f.user_id,
                "update_lead_data",
                &json!({"lead_id": target.id, "field": "value", "value": "1200.50"}),
                &[],
            )
            .await;
        assert!(ok.success);
        assert_eq!(ok.data.unwrap()["value"], 1200.5);

        let bad = f
            .service
            .execute_function_call(
                f.user_id,
                "update_lead_data",
                &json!({"lead_id": target.id, "field": "value", "value": "lots"}),
                &[],
            )
            .await;
        assert!(!bad.success);
        assert_eq!(bad.message, "Invalid value format for lead value field");
    }

    #[tokio::test]
    async fn test_update_lead_data_unknown_lead() {
        let f = fixture(vec![]);
        let outcome = f
            .service
            .execute_function_call(
                f.user_id,
                "update_lead_data",
                &json!({"lead_id": "999", "field": "notes", "value": "x"}),
                &[],
            )
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.message, "Lead not found");
    }

    #[tokio::test]
    async fn test_delete_lead_requires_confirmation() {
        let f = fixture(vec![]);
        let target = seed(&f, NewLead::named("Doomed"));

        let first = f
            .service
            .execute_function_call(f.user_id, "delete_lead", &json!({"lead_id": target.id}), &[])
            .await;
        assert!(first.requires_confirmation);
        let id = target.id;
        let user_id = f.user_id;
        assert!(f.db.call(move |db| db.get_lead(user_id, id)).await.unwrap().is_some());

        let second = f
            .service
            .execute_function_call(
                f.user_id,
                "delete_lead",
                &json!({"lead_id": target.id, "confirmed": true}),
                &[],
            )
            .await;
        assert!(second.success);
        assert!(!second.requires_confirmation);
        assert_eq!(second.message, "Lead 'Doomed' deleted successfully");
        assert!(f.db.call(move |db| db.get_lead(user_id, id)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_unknown_lead() {
        let f = fixture(vec![]);
        let outcome = f
            .service
            .execute_function_call(f.user_id, "delete_lead", &json!({"lead_id": "42", "confirmed": true}), &[])
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.message, "Lead not found");
    }

    #[tokio::test]
    async fn test_unknown_function() {
        let f = fixture(vec![]);
        let outcome = f.service.execute_function_call(f.user_id, "launch_rocket", &json!({}), &[]).await;
        assert!(!outcome.success);
        assert_eq!(outcome.message, "Unknown function: launch_rocket");
    }
}
