//! Emitter behavior: message assembly, line-break discipline, side
//! channels, and structural errors surfaced through the public entry.

mod common;

use common::{FixedText, renderer};
use promptloom::protocol::{ContentPart, ImageDetail, Role, ToolCall};
use promptloom::{Error, Metadata, Node, Props, Reference, UsedContext};
use promptloom::CancellationToken;
use promptloom::{Progress, ProgressUpdate};
use serde_json::json;
use std::sync::{Arc, Mutex};

#[tokio::test]
async fn literals_run_inline_and_elements_break() {
    let tree = Node::user_message(vec![
        Node::text("Hello "),
        Node::text("world"),
        Node::element(FixedText("first block"), Props::new()),
        Node::element(FixedText("second block"), Props::new()),
        Node::text(" tail"),
    ]);
    let result = renderer(100).render(tree).await.unwrap();
    // Adjacent literals join; an element following literal text stays
    // inline with it; sibling elements break once between each other; a
    // trailing literal after an element stays inline.
    assert_eq!(
        result.messages[0].text(),
        "Hello worldfirst block\nsecond block tail"
    );
}

#[tokio::test]
async fn explicit_breaks_are_honored() {
    let tree = Node::user_message(vec![
        Node::text("first"),
        Node::line_break(),
        Node::text("second"),
    ]);
    let result = renderer(100).render(tree).await.unwrap();
    assert_eq!(result.messages[0].text(), "first\nsecond");
}

#[tokio::test]
async fn adjacent_chunks_are_separated_by_one_newline() {
    let tree = Node::user_message(vec![
        Node::text_chunk("one", 1),
        Node::text_chunk("two", 2),
        Node::text_chunk("three", 3),
    ]);
    let result = renderer(100).render(tree).await.unwrap();
    assert_eq!(result.messages[0].text(), "one\ntwo\nthree");
}

#[tokio::test]
async fn messages_keep_their_declared_roles() {
    let tree = Node::fragment(vec![
        Node::system_message(vec![Node::text("be brief")]),
        Node::user_message(vec![Node::text("hi")]),
        promptloom::MessageNode::assistant(vec![Node::text("calling a tool")])
            .with_tool_calls(vec![ToolCall::function(
                "call_1",
                "lookup",
                r#"{"q":"weather"}"#,
            )])
            .into(),
        Node::tool_message("call_1", vec![Node::text("sunny")]),
        promptloom::MessageNode::function("legacy_fn", vec![Node::text("done")]).into(),
    ]);
    let result = renderer(200).render(tree).await.unwrap();

    let roles: Vec<Role> = result.messages.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        [
            Role::System,
            Role::User,
            Role::Assistant,
            Role::Tool,
            Role::Function
        ]
    );
    assert_eq!(result.messages[2].tool_calls.len(), 1);
    assert_eq!(result.messages[3].tool_call_id.as_deref(), Some("call_1"));
    assert_eq!(result.messages[4].name.as_deref(), Some("legacy_fn"));
}

#[tokio::test]
async fn invalid_tool_call_arguments_are_fatal() {
    let tree: Node = promptloom::MessageNode::assistant(vec![Node::text("x")])
        .with_tool_calls(vec![ToolCall::function("call_1", "lookup", "{broken")])
        .into();
    let err = renderer(100).render(tree).await.unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidToolCallArguments { name, .. } if name == "lookup"
    ));
}

#[tokio::test]
async fn text_outside_a_message_is_fatal() {
    let err = renderer(100).render(Node::text("stray")).await.unwrap_err();
    assert!(matches!(err, Error::TextOutsideMessage));
}

#[tokio::test]
async fn nested_messages_are_fatal() {
    let tree = Node::user_message(vec![Node::user_message(vec![Node::text("inner")])]);
    let err = renderer(100).render(tree).await.unwrap_err();
    assert!(matches!(err, Error::NestedMessage));
}

#[tokio::test]
async fn text_chunks_reject_element_children() {
    let tree = Node::user_message(vec![Node::text_chunk_with(
        Props::new(),
        vec![Node::element(FixedText("nope"), Props::new())],
    )]);
    let err = renderer(100).render(tree).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTextChunkChild));
}

#[tokio::test]
async fn checkpoint_only_messages_are_dropped() {
    let tree = Node::fragment(vec![
        Node::user_message(vec![Node::cache_checkpoint()]),
        Node::user_message(vec![Node::text("kept")]),
    ]);
    let result = renderer(100).render(tree).await.unwrap();
    assert_eq!(result.messages.len(), 1);
    assert_eq!(result.messages[0].text(), "kept");
}

#[tokio::test]
async fn images_and_opaque_values_become_parts() {
    let tree = Node::user_message(vec![
        Node::text("look:"),
        Node::image(
            "https://example.com/a.png",
            Some(ImageDetail::High),
            Props::new(),
        ),
        Node::opaque(json!({"blob": true}), Some(7)),
    ]);
    let result = renderer(200).render(tree).await.unwrap();

    let parts = &result.messages[0].content;
    assert_eq!(parts.len(), 3);
    assert!(matches!(parts[1], ContentPart::Image { .. }));
    assert!(matches!(parts[2], ContentPart::Opaque { .. }));
}

#[tokio::test]
async fn declared_opaque_cost_drives_pruning() {
    let tree = Node::user_message(vec![Node::opaque(json!("blob"), Some(7))]);

    // 3 completion + 3 message + 7 declared.
    let result = renderer(13).render(tree.clone()).await.unwrap();
    assert_eq!(result.messages.len(), 1);

    let result = renderer(12).render(tree).await.unwrap();
    assert!(result.messages.is_empty());
}

#[tokio::test]
async fn local_metadata_dies_with_its_chunk() {
    let tree = Node::fragment(vec![
        Node::meta(Metadata::global("model-hint", json!("fast"))),
        Node::user_message(vec![
            Node::text_chunk_with(
                Props::new().with_priority(1),
                vec![
                    Node::text("aaa"),
                    Node::meta(Metadata::local("origin", json!("history"))),
                ],
            ),
            Node::text_chunk("bbb", 5),
        ]),
    ]);

    // Generous budget: both records present.
    let result = renderer(50).render(tree.clone()).await.unwrap();
    let keys: Vec<&str> = result.metadata.iter().map(|m| m.key.as_str()).collect();
    assert!(keys.contains(&"model-hint"));
    assert!(keys.contains(&"origin"));

    // Tight budget: the low-priority chunk leaves and takes its local
    // record along; the global record is immune.
    let result = renderer(7).render(tree).await.unwrap();
    let keys: Vec<&str> = result.metadata.iter().map(|m| m.key.as_str()).collect();
    assert!(keys.contains(&"model-hint"));
    assert!(!keys.contains(&"origin"));
}

#[tokio::test]
async fn pruned_references_are_reported_as_omitted() {
    let tree = Node::user_message(vec![
        Node::container(
            Props::new().with_priority(1),
            vec![
                Node::text_chunk("aaa", 1),
                Node::references(vec![Reference::new("selection")]),
            ],
        ),
        Node::container(
            Props::new().with_priority(9),
            vec![
                Node::text_chunk("bbb", 9),
                Node::references(vec![Reference::new("file")]),
            ],
        ),
    ]);

    let result = renderer(50).render(tree.clone()).await.unwrap();
    let names: Vec<&str> = result
        .references
        .iter()
        .map(|r| r.variable_name.as_str())
        .collect();
    assert_eq!(names, ["selection", "file"]);
    assert!(result.omitted_references.is_empty());

    let result = renderer(7).render(tree).await.unwrap();
    let names: Vec<&str> = result
        .references
        .iter()
        .map(|r| r.variable_name.as_str())
        .collect();
    assert_eq!(names, ["file"]);
    let omitted: Vec<&str> = result
        .omitted_references
        .iter()
        .map(|r| r.variable_name.as_str())
        .collect();
    assert_eq!(omitted, ["selection"]);
}

#[tokio::test]
async fn used_context_and_ignored_files_are_collected() {
    let tree = Node::user_message(vec![
        Node::text("body"),
        Node::used_context(UsedContext::new(json!({"file": "main.rs"}))),
        Node::ignored_files(vec!["secret.env".into()]),
    ]);
    let result = renderer(100).render(tree).await.unwrap();
    assert_eq!(result.used_context.len(), 1);
    assert!(result.has_ignored_files);

    let plain = Node::user_message(vec![Node::text("body")]);
    let result = renderer(100).render(plain).await.unwrap();
    assert!(!result.has_ignored_files);
    assert!(result.used_context.is_empty());
}

#[tokio::test]
async fn renders_are_idempotent() {
    let tree = Node::user_message(vec![
        Node::text_chunk("aaa", 1),
        Node::text_chunk("bbb", 2),
        Node::text_chunk("ccc", 3),
    ]);
    let first = renderer(8).render(tree.clone()).await.unwrap();
    let second = renderer(8).render(tree).await.unwrap();
    assert_eq!(first.messages, second.messages);
    assert_eq!(first.token_count, second.token_count);
}

struct Recorder(Mutex<Vec<ProgressUpdate>>);

impl Progress for Recorder {
    fn report(&self, update: ProgressUpdate) {
        self.0.lock().unwrap().push(update);
    }
}

#[tokio::test]
async fn progress_reports_every_phase() {
    let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
    let tree = Node::user_message(vec![
        Node::text_chunk("aaa", 1),
        Node::text_chunk("bbb", 2),
        Node::text_chunk("ccc", 3),
    ]);
    renderer(8)
        .with_progress(recorder.clone())
        .render(tree)
        .await
        .unwrap();

    let updates = recorder.0.lock().unwrap();
    assert_eq!(
        *updates,
        [
            ProgressUpdate::TreeRendered { consumed: 3 },
            ProgressUpdate::GrowablesExpanded { consumed: 3 },
            ProgressUpdate::Pruned { removed: 1 },
            ProgressUpdate::Complete { token_count: 8 },
        ]
    );
}

#[tokio::test]
async fn a_cancelled_render_aborts() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = renderer(100)
        .with_cancellation(cancel)
        .render(Node::user_message(vec![Node::text("never")]))
        .await;
    assert!(result.unwrap_err().is_cancellation());
}

#[tokio::test]
async fn prepare_can_measure_with_the_render_tokenizer() {
    let tree = Node::user_message(vec![Node::element(
        common::MeasuredText { text: "measure" },
        Props::new(),
    )]);
    let result = renderer(100).render(tree).await.unwrap();
    // "measure" is 7 chars: 2 tokens under the heuristic.
    assert_eq!(result.messages[0].text(), "measure [2]");
}

#[tokio::test]
async fn render_futures_are_send() {
    fn assert_send<T: Send>(value: T) -> T {
        value
    }
    let r = renderer(10);
    let result = assert_send(r.render(Node::user_message(vec![Node::text("x")]))).await;
    assert!(result.is_ok());
}
