//! Property-based tests for LLM provider translation layers.
//!
//! These exercise the pure translate/normalize functions each provider
//! module exposes via its `test_helpers`, checking invariants that are
//! easy to get wrong by hand: block-count preservation, tool-call name/id
//! fidelity, and which responses count as "empty".

#![allow(clippy::redundant_closure_for_method_calls)]

use super::anthropic::{self, AnthropicContentBlock, AnthropicResponse, AnthropicUsage};
use super::openai::{self, OpenAIChoice, OpenAIFunctionCall, OpenAIMessage, OpenAIResponse, OpenAIToolCall, OpenAIUsage};
use super::types::{ContentBlock, ImageSource, LlmMessage, MessageRole};
use proptest::prelude::*;

fn arb_text_block() -> impl Strategy<Value = ContentBlock> {
    "[a-zA-Z0-9 _.!?,]{1,100}".prop_map(|text| ContentBlock::Text { text })
}

fn arb_image_block() -> impl Strategy<Value = ContentBlock> {
    (
        prop_oneof![Just("image/png".to_string()), Just("image/jpeg".to_string())],
        "[a-zA-Z0-9+/]{10,50}",
    )
        .prop_map(|(media_type, data)| ContentBlock::Image {
            source: ImageSource::Base64 { media_type, data },
        })
}

fn arb_json_value() -> impl Strategy<Value = serde_json::Value> {
    prop_oneof![
        Just(serde_json::Value::Null),
        any::<bool>().prop_map(serde_json::Value::Bool),
        (-1000i64..1000).prop_map(|n| serde_json::Value::Number(n.into())),
        "[a-zA-Z0-9 ]{0,50}".prop_map(serde_json::Value::String),
    ]
}

fn arb_tool_use_block() -> impl Strategy<Value = ContentBlock> {
    ("[a-z0-9_]{5,20}", "[a-z_]{3,20}", arb_json_value())
        .prop_map(|(id, name, input)| ContentBlock::ToolUse { id, name, input })
}

fn arb_tool_result_block() -> impl Strategy<Value = ContentBlock> {
    ("[a-z0-9_]{5,20}", "[a-zA-Z0-9 _.!?,]{0,100}", any::<bool>()).prop_map(
        |(tool_use_id, content, is_error)| ContentBlock::ToolResult { tool_use_id, content, is_error },
    )
}

/// A message with exactly one content block — the shape the OpenAI
/// translator handles precisely; anything longer falls onto its lossy
/// multi-block, text-only path.
fn arb_single_block_message(role: MessageRole) -> impl Strategy<Value = LlmMessage> {
    prop_oneof![
        arb_text_block(),
        arb_tool_use_block(),
        arb_tool_result_block(),
    ]
    .prop_map(move |block| LlmMessage { role, content: vec![block] })
}

/// Any valid multi-block assistant message (text + image + tool_use), for
/// the Anthropic translator, which maps every block 1:1 regardless of count.
fn arb_anthropic_message() -> impl Strategy<Value = LlmMessage> {
    proptest::collection::vec(
        prop_oneof![
            3 => arb_text_block(),
            1 => arb_image_block(),
            2 => arb_tool_use_block(),
            2 => arb_tool_result_block(),
        ],
        1..6,
    )
    .prop_map(|content| LlmMessage { role: MessageRole::User, content })
}

fn make_openai_response(
    content: Option<String>,
    tool_calls: Option<Vec<OpenAIToolCall>>,
    finish_reason: Option<String>,
) -> OpenAIResponse {
    OpenAIResponse {
        choices: vec![OpenAIChoice {
            message: OpenAIMessage { role: "assistant".to_string(), content, tool_calls, tool_call_id: None },
            finish_reason,
        }],
        usage: OpenAIUsage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15 },
    }
}

fn make_openai_tool_call(id: &str, name: &str, arguments: &str) -> OpenAIToolCall {
    OpenAIToolCall {
        id: id.to_string(),
        r#type: "function".to_string(),
        function: OpenAIFunctionCall { name: name.to_string(), arguments: arguments.to_string() },
    }
}

fn make_anthropic_response(content: Vec<AnthropicContentBlock>, stop_reason: Option<&str>) -> AnthropicResponse {
    AnthropicResponse {
        content,
        stop_reason: stop_reason.map(String::from),
        usage: AnthropicUsage {
            input_tokens: 10,
            output_tokens: 5,
            cache_creation_input_tokens: None,
            cache_read_input_tokens: None,
        },
    }
}

proptest! {
    /// Anthropic rejects a response with no content blocks at all.
    #[test]
    fn prop_anthropic_normalize_rejects_empty(stop_reason in proptest::option::of("[a-z_]{3,10}")) {
        let resp = make_anthropic_response(vec![], stop_reason.as_deref());
        prop_assert!(anthropic::test_helpers::normalize_response(resp).is_err());
    }

    /// A lone non-empty text block always normalizes to one Text block and
    /// end_turn tracks `stop_reason == "end_turn"` exactly.
    #[test]
    fn prop_anthropic_normalize_text(text in "[a-zA-Z0-9 ]{1,100}", end_turn in any::<bool>()) {
        let stop_reason = if end_turn { "end_turn" } else { "max_tokens" };
        let resp = make_anthropic_response(vec![AnthropicContentBlock::Text { text: text.clone() }], Some(stop_reason));
        let out = anthropic::test_helpers::normalize_response(resp).unwrap();
        prop_assert_eq!(out.content.len(), 1);
        prop_assert_eq!(out.end_turn, end_turn);
        match &out.content[0] {
            ContentBlock::Text { text: t } => prop_assert_eq!(t, &text),
            other => prop_assert!(false, "expected Text, got {:?}", other),
        }
    }

    /// Anthropic's translator maps every block 1:1, preserving order and type.
    #[test]
    fn prop_anthropic_translate_bijective(msg in arb_anthropic_message()) {
        let translated = anthropic::test_helpers::translate_message(&msg);
        prop_assert_eq!(translated.content.len(), msg.content.len());
        for (orig, trans) in msg.content.iter().zip(translated.content.iter()) {
            match (orig, trans) {
                (ContentBlock::Text { .. }, AnthropicContentBlock::Text { .. })
                | (ContentBlock::Image { .. }, AnthropicContentBlock::Image { .. })
                | (ContentBlock::ToolUse { .. }, AnthropicContentBlock::ToolUse { .. })
                | (ContentBlock::ToolResult { .. }, AnthropicContentBlock::ToolResult { .. }) => {}
                (orig, trans) => prop_assert!(false, "type mismatch: {:?} vs {:?}", orig, trans),
            }
        }
    }

    /// Tool calls with a non-empty name survive normalization 1:1, each
    /// carrying its own id and JSON input back out unchanged.
    #[test]
    fn prop_openai_normalize_preserves_named_tools(
        calls in proptest::collection::vec(("[a-z0-9]{5,15}", "[a-z_]{3,15}", arb_json_value()), 1..5),
    ) {
        let n = calls.len();
        let tool_calls: Vec<OpenAIToolCall> = calls
            .iter()
            .map(|(id, name, args)| make_openai_tool_call(id, name, &serde_json::to_string(args).unwrap()))
            .collect();
        let resp = make_openai_response(None, Some(tool_calls), Some("tool_calls".to_string()));
        let out = openai::test_helpers::normalize_response(resp).unwrap();
        let tool_uses: Vec<_> = out.content.iter().filter_map(|b| match b {
            ContentBlock::ToolUse { id, name, input } => Some((id.clone(), name.clone(), input.clone())),
            _ => None,
        }).collect();
        prop_assert_eq!(tool_uses.len(), n);
        for ((id, name, _), (exp_id, exp_name, exp_args)) in tool_uses.iter().zip(calls.iter()) {
            prop_assert_eq!(id, exp_id);
            prop_assert_eq!(name, exp_name);
            let _ = exp_args;
        }
    }

    /// A tool call with an empty function name is dropped, not propagated
    /// as a ToolUse block with an empty name.
    #[test]
    fn prop_openai_normalize_drops_empty_name_tools(id in "[a-z0-9]{5,15}", args in arb_json_value()) {
        let tc = make_openai_tool_call(&id, "", &serde_json::to_string(&args).unwrap());
        let resp = make_openai_response(None, Some(vec![tc]), Some("tool_calls".to_string()));
        let out = openai::test_helpers::normalize_response(resp).unwrap();
        prop_assert!(out.content.iter().all(|b| !matches!(b, ContentBlock::ToolUse { .. })));
    }

    /// Malformed JSON arguments fall back to `{}` rather than failing the
    /// whole response — the provider is trusted to emit valid JSON, and a
    /// parse failure shouldn't lose the rest of the turn.
    #[test]
    fn prop_openai_normalize_defaults_invalid_json_args(id in "[a-z0-9]{5,15}", name in "[a-z_]{3,15}") {
        for invalid in ["{invalid", "not json at all", "{key: unquoted}", "[,]"] {
            let tc = make_openai_tool_call(&id, &name, invalid);
            let resp = make_openai_response(None, Some(vec![tc]), Some("tool_calls".to_string()));
            let out = openai::test_helpers::normalize_response(resp).unwrap();
            let input = out.content.iter().find_map(|b| match b {
                ContentBlock::ToolUse { input, .. } => Some(input.clone()),
                _ => None,
            }).unwrap();
            prop_assert_eq!(input, serde_json::json!({}));
        }
    }

    /// Valid JSON tool arguments round-trip through normalize unchanged.
    #[test]
    fn prop_openai_normalize_valid_json_roundtrips(id in "[a-z0-9]{5,15}", name in "[a-z_]{3,15}", value in arb_json_value()) {
        let json_str = serde_json::to_string(&value).unwrap();
        let tc = make_openai_tool_call(&id, &name, &json_str);
        let resp = make_openai_response(None, Some(vec![tc]), Some("tool_calls".to_string()));
        let out = openai::test_helpers::normalize_response(resp).unwrap();
        let input = out.content.iter().find_map(|b| match b {
            ContentBlock::ToolUse { input, .. } => Some(input.clone()),
            _ => None,
        }).unwrap();
        prop_assert_eq!(input, value);
    }

    /// end_turn is true iff finish_reason is exactly "stop".
    #[test]
    fn prop_openai_normalize_end_turn_matches_finish_reason(text in "[a-zA-Z0-9 ]{1,50}", stop in any::<bool>()) {
        let finish_reason = if stop { "stop" } else { "length" };
        let resp = make_openai_response(Some(text), None, Some(finish_reason.to_string()));
        let out = openai::test_helpers::normalize_response(resp).unwrap();
        prop_assert_eq!(out.end_turn, stop);
    }

    /// A single text block translates to a message with that exact string
    /// as `content` and no tool_calls/tool_call_id.
    #[test]
    fn prop_openai_translate_single_text(text in "[a-zA-Z0-9 _.!?,]{1,100}") {
        let msg = LlmMessage { role: MessageRole::User, content: vec![ContentBlock::Text { text: text.clone() }] };
        let out = openai::test_helpers::translate_message(&msg);
        prop_assert_eq!(out.content, Some(text));
        prop_assert!(out.tool_calls.is_none());
        prop_assert!(out.tool_call_id.is_none());
    }

    /// A single tool_use block becomes exactly one tool_calls entry with
    /// the same id/name and its input preserved as a JSON string.
    #[test]
    fn prop_openai_translate_single_tool_use(
        id in "[a-z0-9_]{5,20}", name in "[a-z_]{3,20}", input in arb_json_value(),
    ) {
        let msg = LlmMessage {
            role: MessageRole::Assistant,
            content: vec![ContentBlock::ToolUse { id: id.clone(), name: name.clone(), input: input.clone() }],
        };
        let out = openai::test_helpers::translate_message(&msg);
        let calls = out.tool_calls.unwrap();
        prop_assert_eq!(calls.len(), 1);
        prop_assert_eq!(&calls[0].id, &id);
        prop_assert_eq!(&calls[0].function.name, &name);
        let round_tripped: serde_json::Value = serde_json::from_str(&calls[0].function.arguments).unwrap();
        prop_assert_eq!(round_tripped, input);
    }

    /// A single tool_result block becomes a `role: "tool"` message carrying
    /// the originating tool_use_id.
    #[test]
    fn prop_openai_translate_single_tool_result(
        tool_use_id in "[a-z0-9_]{5,20}", content in "[a-zA-Z0-9 _.!?,]{0,100}", is_error in any::<bool>(),
    ) {
        let msg = LlmMessage {
            role: MessageRole::User,
            content: vec![ContentBlock::ToolResult { tool_use_id: tool_use_id.clone(), content, is_error }],
        };
        let out = openai::test_helpers::translate_message(&msg);
        prop_assert_eq!(out.role, "tool");
        prop_assert_eq!(out.tool_call_id, Some(tool_use_id));
    }

    /// Single-block messages always serialize without error.
    #[test]
    fn prop_openai_translate_serializes(msg in arb_single_block_message(MessageRole::Assistant)) {
        let out = openai::test_helpers::translate_message(&msg);
        prop_assert!(serde_json::to_value(&out).is_ok());
    }
}
