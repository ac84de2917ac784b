//! XML DOM capability.
//!
//! A document handle owns an arena of element/text nodes built by the XML
//! parser. Node references are document-scoped tokens (`n<index>`), so
//! disposing a document reclaims every node with it; there is no
//! process-global node registry. Parsing and serialization go through the
//! linked XML engine; the tree itself lives here so mutation operations
//! (attributes, children) work without reparsing.

use std::sync::{Arc, Mutex, MutexGuard};

use ferry_proto::ParamMap;
use ferry_types::HandleKind;
use serde_json::{Value, json};
use xml::reader::{EventReader, XmlEvent as ReadEvent};
use xml::writer::{EmitterConfig, XmlEvent as WriteEvent};

use super::{NativeState, opt_bool, opt_str, require_str, unknown_function};
use crate::error::BridgeError;
use crate::state::AppState;

/// Pooled parsed document
pub struct DocumentState {
    inner: Mutex<DomDocument>,
}

impl DocumentState {
    fn lock(&self) -> MutexGuard<'_, DomDocument> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

pub struct DomDocument {
    nodes: Vec<DomNode>,
    root: usize,
}

struct DomNode {
    kind: DomNodeKind,
    parent: Option<usize>,
    children: Vec<usize>,
}

enum DomNodeKind {
    Element {
        tag: String,
        attrs: Vec<(String, String)>,
    },
    Text {
        data: String,
    },
}

/// Entry point for the `xmldom` module.
///
/// # Errors
///
/// Handle errors for dead document ids, execution errors for parse/serialize
/// failures and bad node references, invalid-parameter errors otherwise.
// Uniform handler interface; the other capability modules genuinely await
#[allow(clippy::unused_async)]
pub async fn handle(
    state: &Arc<AppState>,
    function: &str,
    params: &ParamMap,
) -> Result<Value, BridgeError> {
    match function {
        "parse_string" => parse_string(state, params),
        "parse_file" => parse_file(state, params),
        "get_document_root" => get_document_root(state, params),
        "get_elements_by_tag_name" => get_elements_by_tag_name(state, params),
        "get_child_nodes" => get_child_nodes(state, params),
        "get_attribute" => get_attribute(state, params),
        "set_attribute" => set_attribute(state, params),
        "has_attribute" => has_attribute(state, params),
        "remove_attribute" => remove_attribute(state, params),
        "get_text_contents" => get_text_contents(state, params),
        "get_tag_name" => get_tag_name(state, params),
        "create_element" => create_element(state, params),
        "create_text_node" => create_text_node(state, params),
        "append_child" => append_child(state, params),
        "remove_child" => remove_child(state, params),
        "to_string" => to_string(state, params),
        "dispose_document" => dispose_document(state, params),
        other => Err(unknown_function("xmldom", other)),
    }
}

fn parse_string(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let xml = require_str(params, "xml")?;
    store_document(state, parse_document(xml)?)
}

fn parse_file(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let filename = require_str(params, "filename")?;
    let xml = std::fs::read_to_string(filename)
        .map_err(|e| BridgeError::Execution(format!("cannot read {filename}: {e}")))?;
    store_document(state, parse_document(&xml)?)
}

fn store_document(state: &Arc<AppState>, doc: DomDocument) -> Result<Value, BridgeError> {
    let root_id = node_token(doc.root);
    let payload = NativeState::Document(Arc::new(DocumentState {
        inner: Mutex::new(doc),
    }));
    let document_id = state.pool.create(HandleKind::DomDocument, payload)?;
    Ok(json!({ "document_id": document_id, "root_id": root_id }))
}

fn get_document_root(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let document_id = require_str(params, "document_id")?;
    let doc = document_state(state, document_id)?;
    let root = doc.lock().root;
    state.pool.touch(document_id);
    Ok(json!({ "node_id": node_token(root) }))
}

fn get_elements_by_tag_name(
    state: &Arc<AppState>,
    params: &ParamMap,
) -> Result<Value, BridgeError> {
    let document_id = require_str(params, "document_id")?;
    let tag_name = require_str(params, "tag_name")?;
    let doc_state = document_state(state, document_id)?;
    let doc = doc_state.lock();

    let start = match opt_str(params, "node_id")? {
        Some(token) => parse_token(&doc, token)?,
        None => doc.root,
    };

    let mut found = Vec::new();
    collect_elements(&doc, start, tag_name, &mut found);
    let node_ids: Vec<String> = found.into_iter().map(node_token).collect();

    state.pool.touch(document_id);
    Ok(json!({ "count": node_ids.len(), "node_ids": node_ids }))
}

fn get_child_nodes(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let document_id = require_str(params, "document_id")?;
    let token = require_str(params, "node_id")?;
    let doc_state = document_state(state, document_id)?;
    let doc = doc_state.lock();

    let index = parse_token(&doc, token)?;
    let node_ids: Vec<String> = doc.nodes[index]
        .children
        .iter()
        .copied()
        .map(node_token)
        .collect();

    state.pool.touch(document_id);
    Ok(json!({ "count": node_ids.len(), "node_ids": node_ids }))
}

fn get_attribute(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let (document_id, doc_state, token, attr_name) = attr_call(state, params)?;
    let doc = doc_state.lock();
    let index = parse_token(&doc, &token)?;

    let value = element_attrs(&doc, index)?
        .iter()
        .find(|(name, _)| name == &attr_name)
        .map(|(_, value)| value.clone());

    state.pool.touch(&document_id);
    Ok(json!({ "value": value }))
}

fn set_attribute(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let (document_id, doc_state, token, attr_name) = attr_call(state, params)?;
    let value = require_str(params, "value")?.to_string();
    let mut doc = doc_state.lock();
    let index = parse_token(&doc, &token)?;

    let attrs = element_attrs_mut(&mut doc, index)?;
    match attrs.iter().position(|(name, _)| name == &attr_name) {
        Some(i) => attrs[i].1 = value,
        None => attrs.push((attr_name, value)),
    }

    state.pool.touch(&document_id);
    Ok(json!({ "updated": true }))
}

fn has_attribute(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let (document_id, doc_state, token, attr_name) = attr_call(state, params)?;
    let doc = doc_state.lock();
    let index = parse_token(&doc, &token)?;

    let has = element_attrs(&doc, index)?
        .iter()
        .any(|(name, _)| name == &attr_name);

    state.pool.touch(&document_id);
    Ok(json!({ "has": has }))
}

fn remove_attribute(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let (document_id, doc_state, token, attr_name) = attr_call(state, params)?;
    let mut doc = doc_state.lock();
    let index = parse_token(&doc, &token)?;

    let attrs = element_attrs_mut(&mut doc, index)?;
    let before = attrs.len();
    attrs.retain(|(name, _)| name != &attr_name);
    let removed = attrs.len() != before;

    state.pool.touch(&document_id);
    Ok(json!({ "removed": removed }))
}

fn get_text_contents(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let document_id = require_str(params, "document_id")?;
    let token = require_str(params, "node_id")?;
    let trim = opt_bool(params, "trim")?.unwrap_or(false);
    let doc_state = document_state(state, document_id)?;
    let doc = doc_state.lock();

    let index = parse_token(&doc, token)?;
    let mut text = String::new();
    collect_text(&doc, index, &mut text);
    if trim {
        text = text.trim().to_string();
    }

    state.pool.touch(document_id);
    Ok(json!({ "text": text }))
}

fn get_tag_name(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let document_id = require_str(params, "document_id")?;
    let token = require_str(params, "node_id")?;
    let doc_state = document_state(state, document_id)?;
    let doc = doc_state.lock();

    let index = parse_token(&doc, token)?;
    let DomNodeKind::Element { tag, .. } = &doc.nodes[index].kind else {
        return Err(BridgeError::Execution(format!(
            "node {token} is not an element node"
        )));
    };
    let tag = tag.clone();

    state.pool.touch(document_id);
    Ok(json!({ "tag_name": tag }))
}

fn create_element(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let document_id = require_str(params, "document_id")?;
    let tag_name = require_str(params, "tag_name")?.to_string();
    let doc_state = document_state(state, document_id)?;
    let mut doc = doc_state.lock();

    let index = push_node(
        &mut doc,
        DomNodeKind::Element {
            tag: tag_name,
            attrs: Vec::new(),
        },
        None,
    );

    state.pool.touch(document_id);
    Ok(json!({ "node_id": node_token(index) }))
}

fn create_text_node(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let document_id = require_str(params, "document_id")?;
    let data = require_str(params, "data")?.to_string();
    let doc_state = document_state(state, document_id)?;
    let mut doc = doc_state.lock();

    let index = push_node(&mut doc, DomNodeKind::Text { data }, None);

    state.pool.touch(document_id);
    Ok(json!({ "node_id": node_token(index) }))
}

fn append_child(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let document_id = require_str(params, "document_id")?;
    let parent_token = require_str(params, "parent_id")?;
    let child_token = require_str(params, "child_id")?;
    let doc_state = document_state(state, document_id)?;
    let mut doc = doc_state.lock();

    let parent = parse_token(&doc, parent_token)?;
    let child = parse_token(&doc, child_token)?;
    if parent == child || is_ancestor(&doc, child, parent) {
        return Err(BridgeError::Execution(
            "cannot append a node to its own subtree".to_string(),
        ));
    }
    if !matches!(doc.nodes[parent].kind, DomNodeKind::Element { .. }) {
        return Err(BridgeError::Execution(format!(
            "node {parent_token} is not an element node"
        )));
    }

    detach(&mut doc, child);
    doc.nodes[parent].children.push(child);
    doc.nodes[child].parent = Some(parent);

    state.pool.touch(document_id);
    Ok(json!({ "appended": child_token }))
}

fn remove_child(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let document_id = require_str(params, "document_id")?;
    let parent_token = require_str(params, "parent_id")?;
    let child_token = require_str(params, "child_id")?;
    let doc_state = document_state(state, document_id)?;
    let mut doc = doc_state.lock();

    let parent = parse_token(&doc, parent_token)?;
    let child = parse_token(&doc, child_token)?;
    if doc.nodes[child].parent != Some(parent) {
        return Err(BridgeError::Execution(format!(
            "node {child_token} is not a child of {parent_token}"
        )));
    }

    detach(&mut doc, child);

    state.pool.touch(document_id);
    Ok(json!({ "removed": child_token }))
}

fn to_string(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let document_id = require_str(params, "document_id")?;
    let indent = opt_bool(params, "indent")?.unwrap_or(false);
    let doc_state = document_state(state, document_id)?;
    let doc = doc_state.lock();

    let xml = serialize_document(&doc, indent)?;

    state.pool.touch(document_id);
    Ok(json!({ "xml": xml }))
}

fn dispose_document(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let document_id = require_str(params, "document_id")?;
    state.pool.get_kind(document_id, HandleKind::DomDocument)?;
    state.pool.remove(document_id)?;
    Ok(json!({ "disposed": document_id }))
}

// ---- arena helpers ----

fn node_token(index: usize) -> String {
    format!("n{index}")
}

fn parse_token(doc: &DomDocument, token: &str) -> Result<usize, BridgeError> {
    let index: usize = token
        .strip_prefix('n')
        .and_then(|rest| rest.parse().ok())
        .ok_or_else(|| BridgeError::Execution(format!("invalid node id: {token}")))?;
    if index < doc.nodes.len() {
        Ok(index)
    } else {
        Err(BridgeError::Execution(format!("invalid node id: {token}")))
    }
}

fn push_node(doc: &mut DomDocument, kind: DomNodeKind, parent: Option<usize>) -> usize {
    let index = doc.nodes.len();
    doc.nodes.push(DomNode {
        kind,
        parent,
        children: Vec::new(),
    });
    index
}

fn detach(doc: &mut DomDocument, child: usize) {
    if let Some(old_parent) = doc.nodes[child].parent {
        doc.nodes[old_parent].children.retain(|&c| c != child);
    }
    doc.nodes[child].parent = None;
}

fn is_ancestor(doc: &DomDocument, ancestor: usize, node: usize) -> bool {
    let mut current = doc.nodes[node].parent;
    while let Some(index) = current {
        if index == ancestor {
            return true;
        }
        current = doc.nodes[index].parent;
    }
    false
}

fn collect_elements(doc: &DomDocument, index: usize, tag_name: &str, found: &mut Vec<usize>) {
    for &child in &doc.nodes[index].children {
        if let DomNodeKind::Element { tag, .. } = &doc.nodes[child].kind {
            if tag_name == "*" || tag == tag_name {
                found.push(child);
            }
        }
        collect_elements(doc, child, tag_name, found);
    }
}

fn collect_text(doc: &DomDocument, index: usize, out: &mut String) {
    match &doc.nodes[index].kind {
        DomNodeKind::Text { data } => out.push_str(data),
        DomNodeKind::Element { .. } => {
            for &child in &doc.nodes[index].children {
                collect_text(doc, child, out);
            }
        }
    }
}

fn element_attrs<'a>(
    doc: &'a DomDocument,
    index: usize,
) -> Result<&'a Vec<(String, String)>, BridgeError> {
    match &doc.nodes[index].kind {
        DomNodeKind::Element { attrs, .. } => Ok(attrs),
        DomNodeKind::Text { .. } => Err(BridgeError::Execution(format!(
            "node {} is not an element node",
            node_token(index)
        ))),
    }
}

fn element_attrs_mut<'a>(
    doc: &'a mut DomDocument,
    index: usize,
) -> Result<&'a mut Vec<(String, String)>, BridgeError> {
    match &mut doc.nodes[index].kind {
        DomNodeKind::Element { attrs, .. } => Ok(attrs),
        DomNodeKind::Text { .. } => Err(BridgeError::Execution(format!(
            "node {} is not an element node",
            node_token(index)
        ))),
    }
}

type AttrCall = (String, Arc<DocumentState>, String, String);

fn attr_call(state: &Arc<AppState>, params: &ParamMap) -> Result<AttrCall, BridgeError> {
    let document_id = require_str(params, "document_id")?.to_string();
    let token = require_str(params, "node_id")?.to_string();
    let attr_name = require_str(params, "attr_name")?.to_string();
    let doc_state = document_state(state, &document_id)?;
    Ok((document_id, doc_state, token, attr_name))
}

// ---- engine boundary: parse & serialize ----

fn parse_document(xml: &str) -> Result<DomDocument, BridgeError> {
    let reader = EventReader::new(xml.as_bytes());
    let mut doc = DomDocument {
        nodes: Vec::new(),
        root: 0,
    };
    let mut stack: Vec<usize> = Vec::new();
    let mut root: Option<usize> = None;

    for event in reader {
        let event = event.map_err(|e| BridgeError::Execution(format!("XML parse error: {e}")))?;
        match event {
            ReadEvent::StartElement {
                name, attributes, ..
            } => {
                let parent = stack.last().copied();
                let index = push_node(
                    &mut doc,
                    DomNodeKind::Element {
                        tag: name.local_name,
                        attrs: attributes
                            .into_iter()
                            .map(|a| (a.name.local_name, a.value))
                            .collect(),
                    },
                    parent,
                );
                if let Some(parent) = parent {
                    doc.nodes[parent].children.push(index);
                } else {
                    root = Some(index);
                }
                stack.push(index);
            }
            ReadEvent::EndElement { .. } => {
                stack.pop();
            }
            ReadEvent::Characters(data) | ReadEvent::CData(data) => {
                if let Some(&parent) = stack.last() {
                    let index = push_node(&mut doc, DomNodeKind::Text { data }, Some(parent));
                    doc.nodes[parent].children.push(index);
                }
            }
            _ => {}
        }
    }

    match root {
        Some(index) => {
            doc.root = index;
            Ok(doc)
        }
        None => Err(BridgeError::Execution(
            "document has no root element".to_string(),
        )),
    }
}

fn serialize_document(doc: &DomDocument, indent: bool) -> Result<String, BridgeError> {
    let mut out = Vec::new();
    let mut writer = EmitterConfig::new()
        .perform_indent(indent)
        .write_document_declaration(true)
        .create_writer(&mut out);
    write_node(&mut writer, doc, doc.root)?;
    String::from_utf8(out)
        .map_err(|e| BridgeError::Internal(format!("serialized XML is not UTF-8: {e}")))
}

fn write_node<W: std::io::Write>(
    writer: &mut xml::writer::EventWriter<W>,
    doc: &DomDocument,
    index: usize,
) -> Result<(), BridgeError> {
    match &doc.nodes[index].kind {
        DomNodeKind::Element { tag, attrs } => {
            let mut start = WriteEvent::start_element(tag.as_str());
            for (name, value) in attrs {
                start = start.attr(name.as_str(), value);
            }
            writer
                .write(start)
                .map_err(|e| BridgeError::Execution(format!("XML write error: {e}")))?;
            for &child in &doc.nodes[index].children {
                write_node(writer, doc, child)?;
            }
            writer
                .write(WriteEvent::end_element())
                .map_err(|e| BridgeError::Execution(format!("XML write error: {e}")))?;
        }
        DomNodeKind::Text { data } => {
            writer
                .write(WriteEvent::characters(data))
                .map_err(|e| BridgeError::Execution(format!("XML write error: {e}")))?;
        }
    }
    Ok(())
}

fn document_state(state: &Arc<AppState>, id: &str) -> Result<Arc<DocumentState>, BridgeError> {
    match state.pool.get_kind(id, HandleKind::DomDocument)? {
        NativeState::Document(doc) => Ok(doc),
        _ => Err(BridgeError::Internal(format!(
            "handle {id} tagged dom-document holds foreign state"
        ))),
    }
}
