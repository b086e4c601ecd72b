use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::host::{BrowserHost, PageScript, TabHandle, is_scriptable_url};

pub const MAX_INTERACTIVE: usize = 60;
pub const MAX_EDITABLE: usize = 12;
pub const MAX_FORM_CONTROLS_RAW: usize = 80;
pub const MAX_FORM_CONTROLS: usize = 16;
pub const SIGNATURE_TEXT_CHARS: usize = 800;

/// JavaScript injected into the page to produce a structured snapshot.
/// READ-ONLY: it never mutates the DOM.
///
/// The script:
///   1. Finds the active modal: visible dialog-like elements ranked by
///      z-index, then rendered area.
///   2. Collects visible interactive elements from a role/tag allowlist.
///   3. Collects editable fields with a search-like classification.
///   4. Collects raw form controls (checkbox/radio/select/switch state).
///   5. Reads the focused element, a text sample and quiz counters.
/// Ranking, capping and hashing happen in Rust.
pub const SNAPSHOT_JS: &str = r#"
(args) => {
  const MAX_RAW_INTERACTIVE = 300;
  const MAX_RAW_EDITABLE = 40;
  const MAX_RAW_CONTROLS = args.maxFormControls || 80;
  const TEXT_CHARS = args.textChars || 800;

  const INTERACTIVE = 'a[href], button, input:not([type="hidden"]), textarea, select, summary, ' +
    '[role="button"], [role="link"], [role="tab"], [role="menuitem"], [role="menuitemcheckbox"], ' +
    '[role="menuitemradio"], [role="option"], [role="checkbox"], [role="radio"], [role="switch"], ' +
    '[role="textbox"], [role="combobox"], [contenteditable="true"], [contenteditable=""]';
  const EDITABLE = 'input:not([type]), input[type="text"], input[type="search"], input[type="email"], ' +
    'input[type="url"], input[type="tel"], input[type="number"], input[type="password"], textarea, ' +
    '[contenteditable="true"], [contenteditable=""], [role="textbox"], [role="searchbox"]';
  const CONTROLS = 'input[type="checkbox"], input[type="radio"], select, [role="checkbox"], ' +
    '[role="radio"], [role="switch"], [role="option"][aria-selected]';
  const MODALS = 'dialog[open], [role="dialog"], [role="alertdialog"], [aria-modal="true"], ' +
    '.modal.show, .modal.is-open, .modal.open, [class*="modal"][class*="visible"]';

  const clean = (t, n) => String(t || '').replace(/\s+/g, ' ').trim().slice(0, n);
  const visible = (el) => {
    const r = el.getBoundingClientRect();
    if (r.width <= 0 || r.height <= 0) return false;
    const s = getComputedStyle(el);
    return s.display !== 'none' && s.visibility !== 'hidden' && parseFloat(s.opacity || '1') > 0;
  };
  const esc = (v) => (window.CSS && CSS.escape) ? CSS.escape(v) : String(v).replace(/[^a-zA-Z0-9_-]/g, '\\$&');
  const selectorFor = (el) => {
    if (el.id) return '#' + esc(el.id);
    const tag = el.tagName.toLowerCase();
    for (const attr of ['data-testid', 'name', 'aria-label', 'placeholder']) {
      const v = el.getAttribute(attr);
      if (!v) continue;
      const sel = tag + '[' + attr + '="' + v.replace(/"/g, '\\"') + '"]';
      try { if (document.querySelectorAll(sel).length === 1) return sel; } catch (e) {}
    }
    const parts = [];
    let node = el;
    while (node && node.nodeType === 1 && parts.length < 6) {
      if (node.id) { parts.unshift('#' + esc(node.id)); break; }
      let part = node.tagName.toLowerCase();
      const parent = node.parentElement;
      if (parent) {
        const same = Array.from(parent.children).filter((c) => c.tagName === node.tagName);
        if (same.length > 1) part += ':nth-of-type(' + (same.indexOf(node) + 1) + ')';
      }
      parts.unshift(part);
      node = parent;
    }
    return parts.join(' > ');
  };
  const labelFor = (el) => {
    const aria = el.getAttribute('aria-label');
    if (aria) return clean(aria, 80);
    const by = el.getAttribute('aria-labelledby');
    if (by) {
      const l = document.getElementById(by.split(' ')[0]);
      if (l) return clean(l.innerText, 80);
    }
    if (el.id) {
      const l = document.querySelector('label[for="' + el.id.replace(/"/g, '\\"') + '"]');
      if (l) return clean(l.innerText, 80);
    }
    const wrap = el.closest('label');
    if (wrap) return clean(wrap.innerText, 80);
    return clean(el.getAttribute('placeholder') || el.getAttribute('title') || el.getAttribute('name') || '', 80);
  };
  const roleOf = (el) => {
    const explicit = el.getAttribute('role');
    if (explicit) return explicit;
    const tag = el.tagName.toLowerCase();
    if (tag === 'input') {
      const t = (el.type || 'text').toLowerCase();
      if (t === 'checkbox' || t === 'radio') return t;
      if (t === 'submit' || t === 'button' || t === 'reset') return 'button';
      return t === 'search' ? 'searchbox' : 'textbox';
    }
    if (el.isContentEditable) return 'textbox';
    return ({ a: 'link', button: 'button', select: 'combobox', textarea: 'textbox', summary: 'button' })[tag] || tag;
  };
  const searchLike = (el) => {
    const role = (el.getAttribute('role') || '').toLowerCase();
    if ((el.type || '').toLowerCase() === 'search' || role === 'searchbox' || role === 'combobox') return true;
    if (el.getAttribute('aria-autocomplete') === 'list') return true;
    const hay = [el.name, el.id, el.getAttribute('placeholder'), el.getAttribute('aria-label')].join(' ');
    if (/search|query|buscar|suche/i.test(hay) || el.name === 'q') return true;
    return !!el.closest('form[role="search"], [role="search"]');
  };

  const modals = Array.from(document.querySelectorAll(MODALS)).filter(visible).map((el) => {
    const r = el.getBoundingClientRect();
    const z = parseInt(getComputedStyle(el).zIndex, 10);
    return { el, z: isNaN(z) ? 0 : z, area: r.width * r.height };
  }).sort((a, b) => (b.z - a.z) || (b.area - a.area));
  const modalEl = modals.length ? modals[0].el : null;
  const inModal = (el) => !!(modalEl && modalEl.contains(el));

  const interactive = [];
  for (const el of document.querySelectorAll(INTERACTIVE)) {
    if (interactive.length >= MAX_RAW_INTERACTIVE) break;
    if (!visible(el)) continue;
    interactive.push({
      role: roleOf(el),
      text: clean(el.innerText || el.value || '', 80),
      label: labelFor(el),
      selector: selectorFor(el),
      tag: el.tagName.toLowerCase(),
      inModal: inModal(el),
      disabled: !!el.disabled || el.getAttribute('aria-disabled') === 'true',
    });
  }

  const editable = [];
  for (const el of document.querySelectorAll(EDITABLE)) {
    if (editable.length >= MAX_RAW_EDITABLE) break;
    if (!visible(el)) continue;
    const rich = el.isContentEditable;
    const value = rich ? (el.innerText || '') : (el.value || '');
    const secret = (el.type || '').toLowerCase() === 'password';
    editable.push({
      selector: selectorFor(el),
      tag: el.tagName.toLowerCase(),
      kind: rich ? 'rich' : (el.tagName === 'TEXTAREA' ? 'textarea' : (el.type || 'text').toLowerCase()),
      label: labelFor(el),
      searchLike: searchLike(el),
      valuePreview: secret ? '' : clean(value, 60),
      valueLength: value.length,
      inModal: inModal(el),
    });
  }

  const controls = [];
  for (const el of document.querySelectorAll(CONTROLS)) {
    if (controls.length >= MAX_RAW_CONTROLS) break;
    if (!visible(el)) continue;
    const tag = el.tagName.toLowerCase();
    const kind = tag === 'select' ? 'select' : (tag === 'input' ? el.type.toLowerCase() : (el.getAttribute('role') || tag));
    const checked = tag === 'input' ? !!el.checked
      : (el.getAttribute('aria-checked') === 'true' || el.getAttribute('aria-selected') === 'true');
    const groupEl = el.closest('[role="radiogroup"], fieldset');
    controls.push({
      kind,
      checked,
      group: el.name || (groupEl ? labelFor(groupEl) || clean(groupEl.innerText, 40) : ''),
      label: labelFor(el) || clean(el.innerText, 80),
      selector: selectorFor(el),
      value: tag === 'select' ? clean((el.selectedOptions[0] || {}).text || '', 60) : '',
      inModal: inModal(el),
    });
  }

  let modal = null;
  if (modalEl) {
    const heading = modalEl.querySelector('h1, h2, h3, [role="heading"], .modal-title');
    modal = {
      title: clean(modalEl.getAttribute('aria-label') || (heading ? heading.innerText : ''), 120),
      text: clean(modalEl.innerText, 300),
      interactiveCount: interactive.filter((i) => i.inModal).length,
    };
  }

  let focused = null;
  const active = document.activeElement;
  if (active && active !== document.body && active !== document.documentElement) {
    focused = { label: labelFor(active) || clean(active.innerText, 60), role: roleOf(active), tag: active.tagName.toLowerCase() };
  }

  const bodyText = document.body ? document.body.innerText || '' : '';
  let quiz = null;
  const answered = bodyText.match(/(\d+)\s*(?:of|\/)\s*(\d+)\s*(?:questions?\s*)?answered/i);
  const position = bodyText.match(/question\s+(\d+)\s*(?:of|\/)\s*(\d+)/i);
  if (answered) {
    quiz = { answered: parseInt(answered[1], 10), current: position ? parseInt(position[1], 10) : null, total: parseInt(answered[2], 10) };
  } else if (position) {
    quiz = { answered: null, current: parseInt(position[1], 10), total: parseInt(position[2], 10) };
  }

  return {
    url: location.href,
    title: document.title || '',
    text: clean(bodyText, TEXT_CHARS),
    interactive,
    editable,
    controls,
    modal,
    focused,
    quiz,
  };
}
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageKind {
    /// Not scriptable (about:, chrome:, file:).
    Restricted,
    Modal,
    DocumentEditor,
    Video,
    Quiz,
    Generic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractiveElement {
    pub role: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub label: String,
    pub selector: String,
    pub tag: String,
    #[serde(default)]
    pub in_modal: bool,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditableField {
    pub selector: String,
    pub tag: String,
    pub kind: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub search_like: bool,
    #[serde(default)]
    pub value_preview: String,
    #[serde(default)]
    pub value_length: usize,
    #[serde(default)]
    pub in_modal: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormControl {
    pub kind: String,
    #[serde(default)]
    pub checked: bool,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub label: String,
    pub selector: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub in_modal: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModalSummary {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub interactive_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FocusedElement {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub tag: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuizProgress {
    pub answered: Option<u32>,
    pub current: Option<u32>,
    pub total: u32,
}

impl QuizProgress {
    /// True when the counters show questions still to go.
    pub fn has_unanswered(&self) -> bool {
        match (self.answered, self.current) {
            (Some(answered), _) => answered < self.total,
            (None, Some(current)) => current < self.total,
            (None, None) => false,
        }
    }
}

/// Raw payload returned by [`SNAPSHOT_JS`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PageSnapshot {
    pub url: String,
    pub title: String,
    pub text: String,
    pub interactive: Vec<InteractiveElement>,
    pub editable: Vec<EditableField>,
    pub controls: Vec<FormControl>,
    pub modal: Option<ModalSummary>,
    pub focused: Option<FocusedElement>,
    pub quiz: Option<QuizProgress>,
}

/// Structured snapshot of the visible page state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub url: String,
    pub title: String,
    pub page_kind: PageKind,
    pub text_sample: String,
    pub interactive: Vec<InteractiveElement>,
    pub editable_fields: Vec<EditableField>,
    pub form_controls: Vec<FormControl>,
    pub form_state_hash: u32,
    pub active_modal: Option<ModalSummary>,
    pub focused: Option<FocusedElement>,
    pub page_signature: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quiz_progress: Option<QuizProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Observation {
    /// Minimal observation for a tab scripts cannot be injected into.
    pub fn restricted(url: impl Into<String>) -> Self {
        let url = url.into();
        let note = format!(
            "Tab is on '{}', which cannot be inspected. Use open_url to go to an http(s) page.",
            url
        );
        Self {
            page_signature: page_signature(&url, "", "", None),
            url,
            title: String::new(),
            page_kind: PageKind::Restricted,
            text_sample: String::new(),
            interactive: Vec::new(),
            editable_fields: Vec::new(),
            form_controls: Vec::new(),
            form_state_hash: form_state_hash(&[], &[]),
            active_modal: None,
            focused: None,
            quiz_progress: None,
            note: Some(note),
        }
    }

    /// Ranks, caps and hashes a raw snapshot.
    pub fn from_snapshot(snapshot: PageSnapshot) -> Self {
        let PageSnapshot {
            url,
            title,
            text,
            mut interactive,
            editable,
            controls,
            modal,
            focused,
            quiz,
        } = snapshot;

        let text_sample: String = text.chars().take(SIGNATURE_TEXT_CHARS).collect();
        let signature = page_signature(&url, &title, &text_sample, modal.as_ref());
        // Hash over everything the page reported, before capping, so a change
        // in a control past the cap still registers.
        let form_hash = form_state_hash(&controls, &editable);

        // Stable sort keeps document order within each group.
        interactive.sort_by_key(|el| !el.in_modal);
        interactive.truncate(MAX_INTERACTIVE);

        let mut editable_fields = editable;
        editable_fields.sort_by_key(|f| !f.in_modal);
        editable_fields.truncate(MAX_EDITABLE);

        let mut form_controls = controls;
        form_controls.truncate(MAX_FORM_CONTROLS_RAW);
        form_controls.sort_by_key(|c| !c.in_modal);
        form_controls.truncate(MAX_FORM_CONTROLS);

        let page_kind = infer_page_kind(&url, &title, modal.is_some(), quiz.is_some());

        Self {
            url,
            title,
            page_kind,
            text_sample,
            interactive,
            editable_fields,
            form_controls,
            form_state_hash: form_hash,
            active_modal: modal,
            focused,
            page_signature: signature,
            quiz_progress: quiz,
            note: None,
        }
    }

    pub fn modal_present(&self) -> bool {
        self.active_modal.is_some()
    }

    /// Label/role pair identifying the focused element.
    pub fn focus_identity(&self) -> Option<(&str, &str)> {
        self.focused
            .as_ref()
            .map(|f| (f.label.as_str(), f.role.as_str()))
    }
}

/// Reads the tab into an [`Observation`]. Script failures propagate.
pub async fn capture(host: &dyn BrowserHost, tab: &TabHandle) -> Result<Observation> {
    let url = host.tab_url(tab).await.context("failed to read tab url")?;
    if !is_scriptable_url(&url) {
        return Ok(Observation::restricted(url));
    }

    let raw = host
        .run_in_page(
            tab,
            PageScript::Snapshot,
            json!({
                "maxFormControls": MAX_FORM_CONTROLS_RAW,
                "textChars": SIGNATURE_TEXT_CHARS,
            }),
        )
        .await
        .context("snapshot script failed")?;
    let snapshot: PageSnapshot =
        serde_json::from_value(raw).context("snapshot script returned malformed data")?;
    Ok(Observation::from_snapshot(snapshot))
}

/// 32-bit FNV-1a. Order-sensitive and cheap; not collision resistant.
pub fn fnv1a(input: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in input.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

pub fn page_signature(url: &str, title: &str, text: &str, modal: Option<&ModalSummary>) -> u32 {
    let (modal_title, modal_text) = modal
        .map(|m| (m.title.as_str(), m.text.as_str()))
        .unwrap_or(("", ""));
    let text: String = text.chars().take(SIGNATURE_TEXT_CHARS).collect();
    fnv1a(&format!(
        "{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}",
        url, title, text, modal_title, modal_text
    ))
}

pub fn form_state_hash(controls: &[FormControl], editable: &[EditableField]) -> u32 {
    let mut buf = String::new();
    for c in controls {
        buf.push_str(&format!(
            "{}|{}|{}|{}|{}|{}\u{1e}",
            c.kind, c.checked, c.group, c.label, c.selector, c.value
        ));
    }
    for f in editable {
        buf.push_str(&format!(
            "{}|{}|{}\u{1e}",
            f.selector, f.value_length, f.value_preview
        ));
    }
    fnv1a(&buf)
}

pub fn infer_page_kind(url: &str, title: &str, modal: bool, quiz: bool) -> PageKind {
    if modal {
        return PageKind::Modal;
    }
    let parsed = url::Url::parse(url).ok();
    let host = parsed
        .as_ref()
        .and_then(|u| u.host_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    let path = parsed.as_ref().map(|u| u.path()).unwrap_or("");

    if (host == "docs.google.com" && path.starts_with("/document/"))
        || host.ends_with("officeapps.live.com")
        || (host.ends_with("notion.so") && path.len() > 1)
    {
        return PageKind::DocumentEditor;
    }
    let title_lower = title.to_ascii_lowercase();
    if title_lower.ends_with("- youtube")
        || host.ends_with("youtube.com")
        || host.ends_with("vimeo.com")
    {
        return PageKind::Video;
    }
    if quiz {
        return PageKind::Quiz;
    }
    PageKind::Generic
}
