//! System prompts and prompt assembly for both response paths.

use serde_json::Value;

/// Phrase the gathering model is told to end with.
pub const STOP_PHRASE: &str = "Data collection complete.";

/// Question used when the conversation carries no user turn.
pub const DEFAULT_QUESTION: &str = "Analyze my energy usage";

pub const GATHER_SYSTEM_PROMPT: &str = "You are a data gathering assistant. Use the available \
tools to collect energy data. After gathering data, simply say 'Data collection complete.' and stop.";

pub const ASSISTANT_SYSTEM_PROMPT: &str = "You are a Smart Energy Optimization Assistant for a \
household energy monitoring system. Use the available tools to look up real usage, device, \
billing and weather data before answering. Base every number you mention on tool results, \
keep answers concise, and end with concrete, actionable recommendations.";

pub const ANALYSIS_SYSTEM_PROMPT: &str = r#"You are an Elite Smart Energy Optimization AI Assistant.

Provide a comprehensive energy analysis based on the data provided. Use this EXACT structure:

**⚡ EXECUTIVE SUMMARY**
- Current system efficiency: [calculate from device data]%
- Peak usage period: [from peak data] consuming [X] kWh
- Highest consuming device: [device name] at [X] kWh
- Predicted monthly bill: ₹[amount]

**📊 DEVICE PERFORMANCE ANALYSIS**
[For each major device, provide:]
- [Device]: [X] kWh total, [Y]% efficiency, [status]
- Key insight: [specific recommendation]

**🎯 IMMEDIATE ACTION PLAN**

**Phase 1: Quick Wins (This Week)**
1. [Specific action] → Save ₹[X]/month
2. [Specific action] → Save ₹[X]/month
3. [Specific action] → Save ₹[X]/month

**Phase 2: Smart Optimization (Next Month)**
1. [Device upgrade/automation] → ₹[X]/month savings
2. [Scheduling optimization] → ₹[X]/month savings
3. [Efficiency improvement] → [X]% better performance

**💰 FINANCIAL IMPACT**
- Current monthly estimate: ₹[predicted bill amount]
- Potential savings: ₹[X]/month ([Y]% reduction)
- Annual savings opportunity: ₹[X]

**🚀 NEXT STEPS**
- Immediate: [specific 24-hour action]
- This week: [specific weekly goal]
- This month: [specific monthly target]

Use the actual data provided. Include specific numbers and actionable recommendations."#;

/// User prompt for the analysis call: the question followed by every
/// gathered tool result, numbered from 1.
pub fn analysis_prompt(question: Option<&str>, results: &[Value]) -> String {
    let question = question
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .unwrap_or(DEFAULT_QUESTION);

    let mut prompt = question.to_string();
    if !results.is_empty() {
        prompt.push_str("\n\nBased on the following energy data:\n");
        for (i, result) in results.iter().enumerate() {
            let pretty = serde_json::to_string_pretty(result).unwrap_or_else(|_| result.to_string());
            prompt.push_str(&format!("\nTool {} Result: {pretty}\n", i + 1));
        }
    }
    prompt
}
