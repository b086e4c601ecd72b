//! Planner- and executor-independent effect checks.
//!
//! Every verdict is derived from the observations taken immediately before
//! and after an action. Executor metadata is only used to classify what kind
//! of field was typed into, never to decide whether something happened.

use serde::Serialize;
use serde_json::{Value, json};

use crate::dom::Observation;
use crate::hands::LONG_TEXT_CHARS;
use crate::types::{Action, ExecutionResult, VerificationResult, VerifyCode};

pub struct VerifyInput<'a> {
    pub action: &'a Action,
    pub before: &'a Observation,
    pub after: &'a Observation,
    pub exec_result: &'a ExecutionResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Search,
    RichEditor,
    Textarea,
    PlainInput,
    Unknown,
}

pub fn verify(input: VerifyInput<'_>) -> VerificationResult {
    let VerifyInput {
        action,
        before,
        after,
        exec_result,
    } = input;

    match action {
        Action::OpenUrl { url } => verify_navigation(url, before, after),
        Action::ClickText { .. } | Action::ClickSelector { .. } | Action::CloseModal => {
            match meaningful_change(before, after) {
                Some(change) => VerificationResult::pass(
                    format!("{} changed the page ({})", action.kind(), change),
                    json!({ "change": change }),
                ),
                None => VerificationResult::reject(
                    VerifyCode::NoPageChange,
                    format!(
                        "{} reported success but nothing observable changed (url, content, form state, modal and focus are identical)",
                        action.kind()
                    ),
                    json!({ "execMetadata": exec_result.metadata().cloned().unwrap_or(Value::Null) }),
                ),
            }
        }
        Action::TypeSelector { selector, text } => {
            let kind = classify_target(exec_result, selector, after);
            let length = text.chars().count();
            let details = json!({ "targetKind": kind, "textLength": length });
            if kind == TargetKind::Search && length > LONG_TEXT_CHARS {
                return VerificationResult::reject(
                    VerifyCode::WrongTargetKind,
                    format!(
                        "{} characters went into a search field; long text belongs in a content field",
                        length
                    ),
                    details,
                );
            }
            if length > 0 && meaningful_change(before, after).is_none() {
                return VerificationResult::reject(
                    VerifyCode::NoVisibleTextChange,
                    "typing produced no observable change in the page",
                    details,
                );
            }
            VerificationResult::pass(format!("typed {} chars", length), details)
        }
        Action::Wait { .. } | Action::Done { .. } => {
            VerificationResult::pass("nothing to verify", Value::Null)
        }
    }
}

fn verify_navigation(expected: &str, before: &Observation, after: &Observation) -> VerificationResult {
    let details = json!({ "beforeUrl": before.url, "afterUrl": after.url, "expectedUrl": expected });
    if before.url == after.url {
        return VerificationResult::reject(
            VerifyCode::NoNavigationChange,
            format!("URL is still {}", after.url),
            details,
        );
    }
    if let Some(expected_host) = normalized_host(expected) {
        let actual_host = normalized_host(&after.url);
        if actual_host.as_deref() != Some(expected_host.as_str()) {
            return VerificationResult::reject(
                VerifyCode::WrongDestination,
                format!(
                    "navigated to {} but expected host {}",
                    after.url, expected_host
                ),
                details,
            );
        }
    }
    VerificationResult::pass(format!("navigated to {}", after.url), details)
}

/// Name of the first observable difference between two observations.
pub fn meaningful_change(before: &Observation, after: &Observation) -> Option<&'static str> {
    if before.url != after.url {
        Some("url")
    } else if before.page_signature != after.page_signature {
        Some("page_signature")
    } else if before.form_state_hash != after.form_state_hash {
        Some("form_state")
    } else if before.modal_present() != after.modal_present() {
        Some("modal")
    } else if before.focus_identity() != after.focus_identity() {
        Some("focus")
    } else {
        None
    }
}

pub fn classify_target(exec: &ExecutionResult, selector: &str, after: &Observation) -> TargetKind {
    let reported = exec
        .metadata()
        .and_then(|m| m.get("targetKind"))
        .and_then(Value::as_str);
    match reported {
        Some("search") => TargetKind::Search,
        Some("rich") => TargetKind::RichEditor,
        Some("textarea") => TargetKind::Textarea,
        Some("input") => TargetKind::PlainInput,
        _ => match after.editable_fields.iter().find(|f| f.selector == selector) {
            Some(field) if field.search_like => TargetKind::Search,
            Some(field) if field.kind == "rich" => TargetKind::RichEditor,
            Some(field) if field.kind == "textarea" => TargetKind::Textarea,
            Some(_) => TargetKind::PlainInput,
            None => TargetKind::Unknown,
        },
    }
}

fn normalized_host(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url.trim()).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    Some(host.strip_prefix("www.").map(String::from).unwrap_or(host))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{EditableField, FocusedElement, ModalSummary};
    use crate::types::DoneResult;

    fn obs(url: &str) -> Observation {
        let mut o = Observation::restricted(url);
        o.note = None;
        o
    }

    fn ok_exec(metadata: Value) -> ExecutionResult {
        ExecutionResult::ok("native_click", metadata)
    }

    fn run(action: &Action, before: &Observation, after: &Observation) -> VerificationResult {
        verify(VerifyInput {
            action,
            before,
            after,
            exec_result: &ok_exec(json!({})),
        })
    }

    #[test]
    fn open_url_without_navigation_is_rejected() {
        let action = Action::OpenUrl {
            url: "https://a.example".into(),
        };
        let result = run(&action, &obs("https://a.example"), &obs("https://a.example"));
        assert!(!result.ok);
        assert_eq!(result.code, VerifyCode::NoNavigationChange);
    }

    #[test]
    fn open_url_to_wrong_host_is_rejected() {
        let action = Action::OpenUrl {
            url: "https://a.example/x".into(),
        };
        let result = run(&action, &obs("https://a.example"), &obs("https://b.example/x"));
        assert!(!result.ok);
        assert_eq!(result.code, VerifyCode::WrongDestination);
    }

    #[test]
    fn open_url_accepts_www_redirect() {
        let action = Action::OpenUrl {
            url: "https://example.com".into(),
        };
        let result = run(&action, &obs("about:blank"), &obs("https://www.example.com/"));
        assert!(result.ok, "{:?}", result);
    }

    #[test]
    fn click_with_identical_observations_is_a_noop() {
        let action = Action::ClickText {
            text: "Submit".into(),
        };
        let before = obs("https://a.example/form");
        let after = before.clone();
        // The executor claims success; the verdict must not care.
        let result = verify(VerifyInput {
            action: &action,
            before: &before,
            after: &after,
            exec_result: &ok_exec(json!({"ok": true, "mode": "native_click"})),
        });
        assert!(!result.ok);
        assert_eq!(result.code, VerifyCode::NoPageChange);
    }

    #[test]
    fn each_kind_of_change_counts() {
        let before = obs("https://a.example");
        let action = Action::ClickSelector {
            selector: "#go".into(),
        };

        let mut after = before.clone();
        after.page_signature ^= 1;
        assert!(run(&action, &before, &after).ok);

        let mut after = before.clone();
        after.form_state_hash ^= 1;
        assert!(run(&action, &before, &after).ok);

        let mut after = before.clone();
        after.active_modal = Some(ModalSummary {
            title: "Hi".into(),
            text: String::new(),
            interactive_count: 0,
        });
        assert!(run(&action, &before, &after).ok);

        let mut after = before.clone();
        after.focused = Some(FocusedElement {
            label: "Email".into(),
            role: "textbox".into(),
            tag: "input".into(),
        });
        assert_eq!(run(&action, &before, &after).details["change"], "focus");
    }

    #[test]
    fn long_text_into_search_field_is_rejected() {
        let action = Action::TypeSelector {
            selector: "#q".into(),
            text: "x".repeat(120),
        };
        let before = obs("https://a.example");
        let mut after = before.clone();
        after.form_state_hash ^= 1;
        let result = verify(VerifyInput {
            action: &action,
            before: &before,
            after: &after,
            exec_result: &ok_exec(json!({"targetKind": "search", "textLength": 120})),
        });
        assert!(!result.ok);
        assert_eq!(result.code, VerifyCode::WrongTargetKind);
    }

    #[test]
    fn search_classification_falls_back_to_observation() {
        let mut after = obs("https://a.example");
        after.editable_fields.push(EditableField {
            selector: "#q".into(),
            tag: "input".into(),
            kind: "search".into(),
            label: "Search".into(),
            search_like: true,
            value_preview: String::new(),
            value_length: 0,
            in_modal: false,
        });
        let kind = classify_target(&ok_exec(json!({})), "#q", &after);
        assert_eq!(kind, TargetKind::Search);
        assert_eq!(
            classify_target(&ok_exec(json!({})), "#other", &after),
            TargetKind::Unknown
        );
    }

    #[test]
    fn typing_without_visible_change_is_rejected() {
        let action = Action::TypeSelector {
            selector: "#name".into(),
            text: "Ada".into(),
        };
        let before = obs("https://a.example");
        let result = verify(VerifyInput {
            action: &action,
            before: &before,
            after: &before.clone(),
            exec_result: &ok_exec(json!({"targetKind": "input"})),
        });
        assert_eq!(result.code, VerifyCode::NoVisibleTextChange);
    }

    #[test]
    fn typing_into_content_field_passes_with_annotation() {
        let action = Action::TypeSelector {
            selector: "#body".into(),
            text: "y".repeat(200),
        };
        let before = obs("https://a.example");
        let mut after = before.clone();
        after.form_state_hash ^= 7;
        let result = verify(VerifyInput {
            action: &action,
            before: &before,
            after: &after,
            exec_result: &ok_exec(json!({"targetKind": "textarea"})),
        });
        assert!(result.ok);
        assert_eq!(result.details["targetKind"], "textarea");
        assert_eq!(result.details["textLength"], 200);
    }

    #[test]
    fn wait_and_done_always_pass() {
        let o = obs("https://a.example");
        assert!(run(&Action::Wait { ms: 500 }, &o, &o).ok);
        let done = Action::Done {
            result: DoneResult::new("ok"),
        };
        assert!(run(&done, &o, &o).ok);
    }
}
