//! Table-driven finish-reason mapping (spec.md §4.1): stop↔end_turn,
//! length↔max_tokens, tool_calls↔tool_use, content_filter↔refusal; unknown
//! values pass through as `other`.

use crate::canonical::FinishReason;

pub fn finish_reason_from_openai(value: &str) -> FinishReason {
    match value {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "tool_calls" => FinishReason::ToolCalls,
        "content_filter" => FinishReason::ContentFilter,
        _ => FinishReason::Other,
    }
}

pub fn finish_reason_to_openai(reason: FinishReason) -> &'static str {
    match reason {
        FinishReason::Stop => "stop",
        FinishReason::Length => "length",
        FinishReason::ToolCalls => "tool_calls",
        FinishReason::ContentFilter => "content_filter",
        FinishReason::Other => "stop",
    }
}

pub fn finish_reason_from_anthropic(value: &str) -> FinishReason {
    match value {
        "end_turn" | "stop_sequence" => FinishReason::Stop,
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCalls,
        "refusal" => FinishReason::ContentFilter,
        _ => FinishReason::Other,
    }
}

pub fn finish_reason_to_anthropic(reason: FinishReason) -> &'static str {
    match reason {
        FinishReason::Stop => "end_turn",
        FinishReason::Length => "max_tokens",
        FinishReason::ToolCalls => "tool_use",
        FinishReason::ContentFilter => "refusal",
        FinishReason::Other => "end_turn",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_openai() {
        for reason in [
            FinishReason::Stop,
            FinishReason::Length,
            FinishReason::ToolCalls,
            FinishReason::ContentFilter,
        ] {
            let wire = finish_reason_to_openai(reason);
            assert_eq!(finish_reason_from_openai(wire), reason);
        }
    }

    #[test]
    fn round_trips_through_anthropic() {
        for reason in [
            FinishReason::Stop,
            FinishReason::Length,
            FinishReason::ToolCalls,
            FinishReason::ContentFilter,
        ] {
            let wire = finish_reason_to_anthropic(reason);
            assert_eq!(finish_reason_from_anthropic(wire), reason);
        }
    }

    #[test]
    fn unknown_value_is_other() {
        assert_eq!(finish_reason_from_openai("weird"), FinishReason::Other);
        assert_eq!(finish_reason_from_anthropic("weird"), FinishReason::Other);
    }
}
