use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::host::{BrowserHost, PageScript, TabHandle};
use crate::types::{Action, ExecutionResult};

pub const WAIT_MIN_MS: u64 = 100;
pub const WAIT_MAX_MS: u64 = 10_000;
/// Text longer than this is never typed into a search-like field.
pub const LONG_TEXT_CHARS: usize = 80;

/// Helpers shared by the action scripts: visibility, whitespace cleanup and
/// active-modal detection (highest z-index, then largest area).
macro_rules! page_prelude {
    () => {
        r#"
  const MODALS = 'dialog[open], [role="dialog"], [role="alertdialog"], [aria-modal="true"], ' +
    '.modal.show, .modal.is-open, .modal.open, [class*="modal"][class*="visible"]';
  const clean = (t, n) => String(t || '').replace(/\s+/g, ' ').trim().slice(0, n);
  const visible = (el) => {
    const r = el.getBoundingClientRect();
    if (r.width <= 0 || r.height <= 0) return false;
    const view = el.ownerDocument.defaultView || window;
    const s = view.getComputedStyle(el);
    return s.display !== 'none' && s.visibility !== 'hidden' && parseFloat(s.opacity || '1') > 0;
  };
  const fail = (code, message) => ({ ok: false, code, message });
  const modalEl = (() => {
    const ranked = Array.from(document.querySelectorAll(MODALS)).filter(visible).map((el) => {
      const r = el.getBoundingClientRect();
      const z = parseInt(getComputedStyle(el).zIndex, 10);
      return { el, z: isNaN(z) ? 0 : z, area: r.width * r.height };
    }).sort((a, b) => (b.z - a.z) || (b.area - a.area));
    return ranked.length ? ranked[0].el : null;
  })();
"#
    };
}

/// Resolves a click target by CSS selector, a `text=` / `:has-text()`
/// selector extension, or free text, then dispatches the pointer/mouse
/// sequence followed by a native click.
pub const CLICK_JS: &str = concat!(
    "(args) => {",
    page_prelude!(),
    r#"
  const CLICKABLE_ROLES = ['button', 'link', 'tab', 'menuitem', 'menuitemcheckbox', 'menuitemradio',
    'option', 'checkbox', 'radio', 'switch', 'treeitem'];
  const isClickable = (el) => {
    const tag = el.tagName.toLowerCase();
    if (['a', 'button', 'summary', 'select', 'label', 'option'].includes(tag)) return true;
    if (tag === 'input' && (el.type || '').toLowerCase() !== 'hidden') return true;
    if (CLICKABLE_ROLES.includes((el.getAttribute('role') || '').toLowerCase())) return true;
    if (el.hasAttribute('onclick')) return true;
    return getComputedStyle(el).cursor === 'pointer';
  };
  const clickableAncestor = (el) => {
    let node = el;
    for (let hops = 0; node && hops <= 8; hops++, node = node.parentElement) {
      if (isClickable(node)) return { el: node, depth: hops };
    }
    return { el, depth: 9 };
  };
  const textSelector = (sel) => {
    let m = sel.match(/^text=(?:"(.+)"|'(.+)'|(.+))$/);
    if (m) return { base: null, text: m[1] || m[2] || m[3] };
    m = sel.match(/^(.*?):(?:has-text|contains)\((?:"(.*)"|'(.*)')\)$/);
    if (m) return { base: m[1] || null, text: m[2] || m[3] };
    return null;
  };
  const TEXT_CANDIDATES = 'a, button, [role], input[type="submit"], input[type="button"], label, summary, ' +
    'li, span, div, td, p, h1, h2, h3, h4';
  const findByText = (needle, scope, base) => {
    const want = clean(needle, 200).toLowerCase();
    if (!want) return [];
    const hits = [];
    for (const el of scope.querySelectorAll(base || TEXT_CANDIDATES)) {
      if (!visible(el)) continue;
      const own = clean(el.innerText || el.value || el.getAttribute('aria-label') || '', 300).toLowerCase();
      if (!own) continue;
      let rank;
      if (own === want) rank = 0;
      else if (own.includes(want)) rank = 1;
      else continue;
      const { el: target, depth } = clickableAncestor(el);
      hits.push({ el: target, rank, depth, len: own.length });
    }
    hits.sort((a, b) => (a.rank - b.rank) || (a.depth - b.depth) || (a.len - b.len));
    return hits;
  };

  let target = null;
  let resolvedBy = '';
  if (args.selector) {
    let found;
    try {
      found = Array.from(document.querySelectorAll(args.selector)).filter(visible);
      resolvedBy = 'css';
    } catch (e) {
      const ext = textSelector(args.selector);
      if (!ext) return fail('INVALID_SELECTOR', 'Invalid selector: ' + args.selector);
      try {
        found = findByText(ext.text, document, ext.base).map((h) => h.el);
      } catch (e2) {
        return fail('INVALID_SELECTOR', 'Invalid selector: ' + args.selector);
      }
      resolvedBy = 'text_selector';
    }
    if (!found.length) return fail('NOT_FOUND', 'No visible element matches selector ' + args.selector);
    if (modalEl) {
      const inside = found.filter((el) => modalEl.contains(el));
      if (!inside.length) {
        return fail('OUTSIDE_ACTIVE_MODAL', 'Element ' + args.selector +
          ' is outside the active modal; interact with the modal or close it first');
      }
      found = inside;
    }
    target = found[0];
  } else if (args.text) {
    const hits = findByText(args.text, modalEl || document, null);
    if (!hits.length) {
      if (modalEl && findByText(args.text, document, null).length) {
        return fail('OUTSIDE_ACTIVE_MODAL', 'Text "' + args.text +
          '" is only outside the active modal; interact with the modal or close it first');
      }
      return fail('NOT_FOUND', 'No visible element with text "' + args.text + '"');
    }
    target = hits[0].el;
    resolvedBy = hits[0].rank === 0 ? 'exact_text' : 'partial_text';
  } else {
    return fail('MISSING_TARGET', 'click requires a selector or text');
  }

  target.scrollIntoView({ block: 'center', inline: 'center' });
  const r = target.getBoundingClientRect();
  const opts = { bubbles: true, cancelable: true, view: window, button: 0,
    clientX: r.left + r.width / 2, clientY: r.top + r.height / 2 };
  const Pointer = window.PointerEvent || MouseEvent;
  target.dispatchEvent(new Pointer('pointerdown', opts));
  target.dispatchEvent(new MouseEvent('mousedown', opts));
  target.dispatchEvent(new Pointer('pointerup', opts));
  target.dispatchEvent(new MouseEvent('mouseup', opts));
  // One activation only: a second synthetic click would toggle checkboxes back.
  let mode = 'native_click';
  if (typeof target.click === 'function') {
    target.click();
  } else {
    target.dispatchEvent(new MouseEvent('click', opts));
    mode = 'synthetic_click';
  }
  return {
    ok: true,
    mode,
    resolvedBy,
    tag: target.tagName.toLowerCase(),
    text: clean(target.innerText || target.value || '', 80),
    disabled: !!target.disabled || target.getAttribute('aria-disabled') === 'true',
    inModal: !!(modalEl && modalEl.contains(target)),
  };
}"#
);

/// Resolves an editable target (selector first, then focus / rich editor /
/// non-search heuristics across same-origin frames) and writes text into it.
pub const TYPE_JS: &str = concat!(
    "(args) => {",
    page_prelude!(),
    r#"
  const text = String(args.text || '');
  const isLong = text.length > (args.longText || 80);
  const EDITABLE = 'input:not([type]), input[type="text"], input[type="search"], input[type="email"], ' +
    'input[type="url"], input[type="tel"], input[type="number"], input[type="password"], textarea, ' +
    '[contenteditable="true"], [contenteditable=""], [role="textbox"], [role="searchbox"]';
  const NON_TEXT = ['checkbox', 'radio', 'submit', 'button', 'hidden', 'file', 'image', 'reset', 'range', 'color'];
  const isEditable = (el) => !!el && el.nodeType === 1 && (el.isContentEditable || el.tagName === 'TEXTAREA' ||
    (el.tagName === 'INPUT' && !NON_TEXT.includes((el.type || 'text').toLowerCase())) ||
    ['textbox', 'searchbox'].includes((el.getAttribute('role') || '').toLowerCase()));
  const searchLike = (el) => {
    const role = (el.getAttribute('role') || '').toLowerCase();
    if ((el.type || '').toLowerCase() === 'search' || role === 'searchbox' || role === 'combobox') return true;
    if (el.getAttribute('aria-autocomplete') === 'list') return true;
    const hay = [el.name, el.id, el.getAttribute('placeholder'), el.getAttribute('aria-label')].join(' ');
    if (/search|query|buscar|suche/i.test(hay) || el.name === 'q') return true;
    return !!el.closest('form[role="search"], [role="search"]');
  };
  const kindOf = (el) => {
    if (searchLike(el)) return 'search';
    if (el.isContentEditable || (el.tagName !== 'INPUT' && el.tagName !== 'TEXTAREA')) return 'rich';
    return el.tagName === 'TEXTAREA' ? 'textarea' : 'input';
  };
  const docs = () => {
    const list = [document];
    for (const frame of document.querySelectorAll('iframe')) {
      try { if (frame.contentDocument) list.push(frame.contentDocument); } catch (e) {}
    }
    return list;
  };
  const deepActive = () => {
    let el = document.activeElement;
    while (el && el.tagName === 'IFRAME') {
      try { el = el.contentDocument.activeElement; } catch (e) { break; }
    }
    return el;
  };

  let target = null;
  let resolvedBy = '';
  if (args.selector) {
    for (const doc of docs()) {
      let el = null;
      try { el = doc.querySelector(args.selector); } catch (e) { break; }
      if (!el) continue;
      if (!isEditable(el)) el = el.querySelector(EDITABLE) || el;
      if (isEditable(el)) { target = el; resolvedBy = 'selector'; break; }
    }
  }
  if (!target) {
    const allowed = (el) => !(isLong && searchLike(el));
    const candidates = [];
    for (const doc of docs()) {
      for (const el of doc.querySelectorAll(EDITABLE)) {
        if (visible(el) && (!modalEl || modalEl.contains(el) || el.ownerDocument !== document)) candidates.push(el);
      }
    }
    const active = deepActive();
    const rich = candidates.find((el) => el.isContentEditable && allowed(el));
    const plain = candidates.filter(allowed);
    if (isEditable(active) && allowed(active)) { target = active; resolvedBy = 'focused'; }
    else if (rich) { target = rich; resolvedBy = 'rich'; }
    else if (plain.length) { target = plain[0]; resolvedBy = 'fallback'; }
  }
  if (!target) return fail('NOT_FOUND', 'No editable element matches ' + (args.selector || 'the page'));

  const targetKind = kindOf(target);
  if (isLong && targetKind === 'search') {
    return fail('SEARCH_FIELD_LONG_TEXT', 'Refusing to type ' + text.length +
      ' characters into a search-like field; pick the content field instead');
  }

  target.scrollIntoView({ block: 'center' });
  target.focus();
  const doc = target.ownerDocument;
  const view = doc.defaultView || window;
  let mode;
  if (targetKind === 'rich') {
    const sel = doc.getSelection();
    const range = doc.createRange();
    range.selectNodeContents(target);
    sel.removeAllRanges();
    sel.addRange(range);
    let inserted = false;
    try { inserted = doc.execCommand('insertText', false, text); } catch (e) {}
    const probe = clean(text, 40);
    if (inserted && clean(target.innerText, 100000).includes(probe)) {
      mode = 'insert_text';
    } else {
      target.textContent = text;
      target.dispatchEvent(new view.InputEvent('input', { bubbles: true, inputType: 'insertText', data: text }));
      mode = 'raw_replace';
    }
  } else {
    const proto = target.tagName === 'TEXTAREA' ? view.HTMLTextAreaElement.prototype : view.HTMLInputElement.prototype;
    const setter = Object.getOwnPropertyDescriptor(proto, 'value').set;
    setter.call(target, text);
    target.dispatchEvent(new view.Event('input', { bubbles: true }));
    target.dispatchEvent(new view.Event('change', { bubbles: true }));
    mode = 'native_value';
  }
  const value = target.isContentEditable ? (target.innerText || '') : (target.value || '');
  return {
    ok: true,
    mode,
    targetKind,
    resolvedBy,
    tag: target.tagName.toLowerCase(),
    textLength: text.length,
    valueLength: value.length,
  };
}"#
);

/// Clicks a close-like control inside the active modal, or sends Escape.
pub const CLOSE_MODAL_JS: &str = concat!(
    "(args) => {",
    page_prelude!(),
    r#"
  if (!modalEl) return fail('NO_ACTIVE_MODAL', 'There is no active modal to close');
  const CLOSE = /^(close|cancel|done|ok|okay|dismiss|got it|no thanks|not now|×|x|✕)$/i;
  const controls = modalEl.querySelectorAll('button, [role="button"], a, [aria-label], input[type="button"], input[type="submit"]');
  for (const el of controls) {
    if (!visible(el)) continue;
    const label = clean(el.getAttribute('aria-label') || '', 60);
    const text = clean(el.innerText || el.value || '', 60);
    if (CLOSE.test(text) || CLOSE.test(label) || /\b(close|dismiss)\b/i.test(label)) {
      el.click();
      return { ok: true, mode: 'close_control', control: text || label };
    }
  }
  const opts = { key: 'Escape', code: 'Escape', keyCode: 27, which: 27, bubbles: true, cancelable: true };
  const target = document.activeElement || modalEl;
  target.dispatchEvent(new KeyboardEvent('keydown', opts));
  target.dispatchEvent(new KeyboardEvent('keyup', opts));
  return { ok: true, mode: 'escape_key' };
}"#
);

/// Applies actions to the run's tab.
pub struct Executor {
    host: Arc<dyn BrowserHost>,
    settle: Duration,
    navigation_timeout: Duration,
    navigation_poll: Duration,
}

impl Executor {
    pub fn new(host: Arc<dyn BrowserHost>, config: &AgentConfig) -> Self {
        Self {
            host,
            settle: Duration::from_millis(config.action_settle_ms),
            navigation_timeout: Duration::from_millis(config.navigation_timeout_ms),
            navigation_poll: Duration::from_millis(config.navigation_poll_ms.max(1)),
        }
    }

    /// Page-level failures (element not found, refused input) come back as
    /// `ExecutionResult::Failed`; malformed actions and host errors are `Err`.
    pub async fn execute(&self, tab: &TabHandle, action: &Action) -> Result<ExecutionResult> {
        action.validate().map_err(AgentError::InvalidAction)?;
        debug!(action = %action.describe(), tab = %tab.id, "executing");

        match action {
            Action::Done { result } => Ok(ExecutionResult::ok("done", json!({ "result": result }))),
            Action::OpenUrl { url } => self.open_url(tab, url).await,
            Action::ClickText { text } => {
                self.page_action(tab, PageScript::Click, json!({ "text": text }))
                    .await
            }
            Action::ClickSelector { selector } => {
                self.page_action(tab, PageScript::Click, json!({ "selector": selector }))
                    .await
            }
            Action::TypeSelector { selector, text } => {
                self.page_action(
                    tab,
                    PageScript::Type,
                    json!({ "selector": selector, "text": text, "longText": LONG_TEXT_CHARS }),
                )
                .await
            }
            Action::CloseModal => {
                self.page_action(tab, PageScript::CloseModal, json!({}))
                    .await
            }
            Action::Wait { ms } => {
                let clamped = clamp_wait(*ms);
                tokio::time::sleep(Duration::from_millis(clamped)).await;
                Ok(ExecutionResult::ok("wait", json!({ "ms": clamped })))
            }
        }
    }

    async fn open_url(&self, tab: &TabHandle, url: &str) -> Result<ExecutionResult> {
        let parsed = match url::Url::parse(url.trim()) {
            Ok(parsed) => parsed,
            Err(e) => {
                return Ok(ExecutionResult::failed(
                    "INVALID_URL",
                    format!("'{}' is not a valid URL: {}", url, e),
                ));
            }
        };
        if !matches!(parsed.scheme(), "http" | "https") {
            return Ok(ExecutionResult::failed(
                "INVALID_URL",
                format!("Only http/https URLs can be opened, got '{}'", url),
            ));
        }

        self.host
            .navigate(tab, parsed.as_str())
            .await
            .map_err(AgentError::browser)?;

        let started = Instant::now();
        let mut ready_state = String::from("unknown");
        let timed_out = loop {
            // The page context is torn down mid-navigation; errors here just
            // mean "not ready yet".
            if let Ok(Value::String(state)) = self
                .host
                .run_in_page(tab, PageScript::ReadyState, Value::Null)
                .await
            {
                ready_state = state;
                if ready_state == "complete" {
                    break false;
                }
            }
            if started.elapsed() >= self.navigation_timeout {
                break true;
            }
            tokio::time::sleep(self.navigation_poll).await;
        };

        let final_url = self
            .host
            .tab_url(tab)
            .await
            .unwrap_or_else(|_| parsed.to_string());
        if timed_out {
            debug!(url = %final_url, "navigation did not finish loading in time");
        }
        Ok(ExecutionResult::ok(
            "navigate",
            json!({
                "requestedUrl": parsed.as_str(),
                "finalUrl": final_url,
                "readyState": ready_state,
                "timedOut": timed_out,
            }),
        ))
    }

    async fn page_action(
        &self,
        tab: &TabHandle,
        script: PageScript,
        args: Value,
    ) -> Result<ExecutionResult> {
        let reply = self
            .host
            .run_in_page(tab, script, args)
            .await
            .map_err(AgentError::browser)?;
        let result = interpret_reply(script, reply);
        if result.is_ok() && !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
        Ok(result)
    }
}

/// Maps the `{ok, code, message, mode, ...}` object scripts return.
fn interpret_reply(script: PageScript, reply: Value) -> ExecutionResult {
    let ok = reply.get("ok").and_then(Value::as_bool).unwrap_or(false);
    if ok {
        let mode = reply
            .get("mode")
            .and_then(Value::as_str)
            .unwrap_or(script.name())
            .to_string();
        return ExecutionResult::ok(mode, reply);
    }
    let code = reply
        .get("code")
        .and_then(Value::as_str)
        .unwrap_or("SCRIPT_FAILED");
    let message = reply
        .get("message")
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(|| format!("{} script returned {}", script.name(), reply));
    ExecutionResult::failed(code, message)
}

pub fn clamp_wait(ms: u64) -> u64 {
    ms.clamp(WAIT_MIN_MS, WAIT_MAX_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_is_clamped() {
        assert_eq!(clamp_wait(0), 100);
        assert_eq!(clamp_wait(2_500), 2_500);
        assert_eq!(clamp_wait(60_000), 10_000);
    }

    #[test]
    fn failed_reply_keeps_code_and_message() {
        let result = interpret_reply(
            PageScript::Click,
            json!({"ok": false, "code": "OUTSIDE_ACTIVE_MODAL", "message": "outside"}),
        );
        assert_eq!(
            result,
            ExecutionResult::failed("OUTSIDE_ACTIVE_MODAL", "outside")
        );
    }

    #[test]
    fn ok_reply_uses_reported_mode() {
        let result = interpret_reply(
            PageScript::Type,
            json!({"ok": true, "mode": "native_value", "targetKind": "input"}),
        );
        match result {
            ExecutionResult::Ok { mode, metadata } => {
                assert_eq!(mode, "native_value");
                assert_eq!(metadata["targetKind"], "input");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn malformed_reply_is_a_failure() {
        let result = interpret_reply(PageScript::CloseModal, Value::Null);
        match result {
            ExecutionResult::Failed { code, .. } => assert_eq!(code, "SCRIPT_FAILED"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn scripts_are_function_expressions() {
        for script in [CLICK_JS, TYPE_JS, CLOSE_MODAL_JS] {
            assert!(script.starts_with("(args) => {"));
            assert!(script.trim_end().ends_with('}'));
            assert!(script.contains("const modalEl"));
        }
    }
}
