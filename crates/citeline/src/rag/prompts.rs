//! Prompt templates for generation, planning, analysis and metadata intake.
//!
//! Templates are plain strings with named `{placeholder}` slots filled by
//! `fill`; JSON examples inside them stay literal that way.

use crate::types::OutputFormat;

const BASE_PROMPT: &str = r#"
You are an AI assistant that generates responses from the **numbered context** below. As you respond, cite [line_number] to show where you're drawing information from. You must select all the lines that are relevant to the response.

For multiple citations use [56][12] (e.g. separate brackets). Ranges like [56-58] are only allowed for purely numeric line citations. Never use ranges for table citations like [57K].

1. CONTEXT INFORMATION
    - Date: {context_date}
    - Project: {project_description}
    - Template: {template_description}

2. SECTION TO ANSWER
    - Name: {section_name}
    - Description: {section_description}

    - Follow any instructions in the description.

3. HOW TO USE THE CONTEXT
    - The context is numbered sentences from source documents.
    - You may summarize facts, combine facts, perform calculations, and sequence events when every piece is present.
    - **Formula calculations:** when the section requires a computed answer, calculate it yourself using values from the context and show the calculation explicitly with all components and their values.
    - **Temporal validation:** when computing financial ratios, make sure all numerator and denominator components come from the **same reporting period**.
    - **Ambiguity handling:** always note conflicts when values materially differ. Rounding differences do NOT count as conflicts.
    - Do **not** fabricate or guess beyond what the context provides. **CRITICAL**: A partial answer is ALWAYS better than "No data available".
"#;

const PREVIOUS_SECTIONS_BLOCK: &str = r#"
**PREVIOUS SECTIONS**
{dependent_sections_context}

    - **CRITICAL**: Only cite the numbered context below. NEVER cite previous sections.
"#;

const TEXT_PROMPT: &str = r#"
4. FORMAT THE ANSWER
    - Free prose, one sentence per line.
    - Show calculations step-by-step when applicable (e.g., "($15.2B - $12.1B) / $12.1B = 25.6%").
    - **Cite after each statement**:
      CORRECT: YouTube had 12.8% share. [340] Meta had lower share. [341]
      WRONG: YouTube had 12.8% share, surpassing Meta. [340][341]

5. CONTEXT
{numbered_context}
"#;

const TABLE_PROMPT: &str = r#"
4. OUTPUT FORMAT: STRUCTURED JSON TABLE
    - **ALWAYS** return a structured JSON object with rows and cells.

5. JSON STRUCTURE
    - Use descriptive headers based on actual data (e.g., "Q2 2024", "Revenue", "YoY Change (%)").
    - Include units in headers when relevant (e.g., "Revenue ($ millions)").

    Return **exactly** this schema:

{
  "rows": [
    {
      "cells": [
        { "text": "Metric", "tags": [] },
        { "text": "Q2 2024", "tags": [] },
        { "text": "Q2 2023", "tags": [] }
      ]
    },
    {
      "cells": [
        { "text": "Revenue", "tags": [] },
        { "text": "$47.5B", "tags": ["122", "124"] },
        { "text": "$39.1B", "tags": ["308"] }
      ]
    }
  ]
}

6. CITATION GUIDELINES
    - Headers and labels: empty "tags": []
    - Data cells: include citation tags "tags": ["122", "208"]
    - Use ranges only for consecutive numeric lines.
    - No inline citations in text content.

7. NO DATA FORMAT
    Only if ZERO relevant data exists:

{
  "rows": [
    { "cells": [{ "text": "Item", "tags": [] }, { "text": "Value", "tags": [] }] },
    { "cells": [{ "text": "No data available", "tags": [] }, { "text": "No data available", "tags": [] }] }
  ]
}

8. CONSTRAINTS
    - Do **not** add commentary or mention reasoning.
    - Ensure valid JSON.

9. CONTEXT
{numbered_context}
"#;

const CHART_PROMPT: &str = r#"
4. OUTPUT FORMAT: JSON TABLE + CHART TYPE
    - **ALWAYS** return a structured JSON object with rows, cells, and `suggested_chart_type`.

5. JSON STRUCTURE
    - Row 0 = headers, Row 1+ = data
    - **Column 0** is the X-axis (category labels like "Revenue", "Q1 2024", "North America")
    - **Columns 1+** are Y-axis series (numeric values, each column = one bar/line in legend)
    - Numbers can include symbols ($, %, B, M) - they will be parsed automatically.

    Return **exactly** this schema:

{
  "rows": [
    {
      "cells": [
        { "text": "Metric", "tags": [] },
        { "text": "Q2 2024", "tags": [] },
        { "text": "Q2 2023", "tags": [] }
      ]
    },
    {
      "cells": [
        { "text": "Revenue", "tags": [] },
        { "text": "$47.5B", "tags": ["122", "124"] },
        { "text": "$39.1B", "tags": ["308"] }
      ]
    }
  ],
  "suggested_chart_type": "bar"
}

6. CHART TYPE (required)
    Choose ONE: **"bar"** | **"line"** | **"pie"** | **"area"**

    - **bar** - comparisons, market share, discrete categories
    - **line** - trends over time, time series
    - **pie** - percentage breakdowns (2-7 categories)
    - **area** - cumulative values, stacked comparisons

7. CITATION GUIDELINES
    - Headers and labels: empty "tags": []
    - Data cells: include citation tags "tags": ["122", "208"]

8. NO DATA FORMAT
    Only if ZERO relevant data exists:

{
  "rows": [
    { "cells": [{ "text": "Item", "tags": [] }, { "text": "Value", "tags": [] }] },
    { "cells": [{ "text": "No data available", "tags": [] }, { "text": "No data available", "tags": [] }] }
  ],
  "suggested_chart_type": "bar"
}

9. CONSTRAINTS
    - Do **not** add commentary or mention reasoning.
    - Ensure valid JSON.

10. CONTEXT
{numbered_context}
"#;

const RETRIEVAL_PLANNER_PROMPT: &str = r#"
You are a retrieval planner. Your queries will be converted to embeddings and matched against document chunks.

CONTEXT INFORMATION
    - Date: {context_date} (today's date)
    - Project: {project_description}
    - Template: {template_description}

INPUT
  Section: {section_name}
  Description: {section_description}

TASK
  Generate the absolute MINIMUM number of search queries needed. Each query must target distinct information with no overlap. Only create separate queries when information requires different search terms to retrieve.

  Generate 1-8 search queries MAXIMUM.

    - **Financial metrics** - include queries for both the current and all comparative periods referenced.
    - **Trend analysis** - generate separate queries that explicitly name each time period or date range mentioned in the section description.
    - **Calculations** - add queries for every individual component required to compute the answer.
    - **Be specific** - include company names, metric names, and time periods when mentioned in the section description.

Return your response as JSON with this structure:
{
  "queries": [
    "search query 1 for vector embedding",
    "..."
  ]
}
"#;

const ANALYSIS_PROMPT: &str = r#"
You are an evidence auditor reviewing an AI-generated answer against the context it was drawn from.

1. SECTION
- Name: {section_name}
- Description: {section_description}

2. PROJECT CONTEXT
- Date: {context_date}
- Project: {project_description}
- Template: {template_description}

3. NUMBERED CONTEXT
{numbered_context}

4. GENERATED RESPONSE
{formatted_response}

5. SCORE THE RESPONSE (be strict)
- 90-100: every claim grounded in the context, all required data points covered
- 70-89: mostly grounded, minor gaps
- 40-69: partial answer, notable gaps
- 0-39: unsupported or empty answer

**CRITICAL**: Missing specific numbers (revenue, costs, percentages) means a score below 40. Topic relevance alone is NOT sufficient.

6. SEARCH QUERIES (if score < 90)
Propose specific searches for missing data points. Include company names, metrics, time periods.

7. OUTPUT FORMAT
Return ONLY this JSON:

{
  "score": 0,
  "summary": "<1-2 sentences: what is vs is not supported>",
  "queries": ["<precise search query targeting missing data>"]
}

If score >= 90, return empty queries.
"#;

const INTAKE_PROMPT: &str = r#"Extract metadata as JSON:

{
  "company": "company name or null",
  "ticker": "stock symbol or null",
  "doc_type": "10-K, 10-Q, 8-K, earnings_release, earnings_call, investor_presentation, equity_research, financial_model, merger_agreement, press_release, industry_report, website_content, cim, pitch_deck, other, or null",
  "period_label": "time period (Q1 2025, FY 2024, etc.) or null",
  "blurb": "2-3 sentence summary with key metrics"
}

DOCUMENT:
{document_text}
"#;

fn fill(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in values {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

/// Inputs shared by the generation, planning and analysis prompts.
#[derive(Debug, Clone)]
pub struct SectionPromptInputs<'a> {
    pub section_name: &'a str,
    pub section_description: &'a str,
    pub template_description: &'a str,
    pub project_description: &'a str,
    pub context_date: &'a str,
}

impl<'a> SectionPromptInputs<'a> {
    fn pairs(&self) -> Vec<(&'static str, &'a str)> {
        vec![
            ("section_name", self.section_name),
            ("section_description", self.section_description),
            ("template_description", self.template_description),
            ("project_description", self.project_description),
            ("context_date", self.context_date),
        ]
    }
}

/// Full generation prompt: base block, optional previous-sections block, and
/// the format-specific block carrying the numbered context.
pub fn section_prompt(
    inputs: &SectionPromptInputs<'_>,
    numbered_context: &str,
    output_format: OutputFormat,
    dependent_sections_context: Option<&str>,
) -> String {
    let mut prompt = fill(BASE_PROMPT, &inputs.pairs());

    if let Some(dependent) = dependent_sections_context {
        prompt.push_str(&fill(
            PREVIOUS_SECTIONS_BLOCK,
            &[("dependent_sections_context", dependent)],
        ));
    }

    let format_block = match output_format {
        OutputFormat::Text => TEXT_PROMPT,
        OutputFormat::Table => TABLE_PROMPT,
        OutputFormat::Chart => CHART_PROMPT,
    };
    prompt.push_str(&fill(format_block, &[("numbered_context", numbered_context)]));

    prompt
}

pub fn planner_prompt(inputs: &SectionPromptInputs<'_>) -> String {
    fill(RETRIEVAL_PLANNER_PROMPT, &inputs.pairs())
}

pub fn analysis_prompt(
    inputs: &SectionPromptInputs<'_>,
    numbered_context: &str,
    formatted_response: &str,
) -> String {
    let mut pairs = inputs.pairs();
    pairs.push(("numbered_context", numbered_context));
    pairs.push(("formatted_response", formatted_response));
    fill(ANALYSIS_PROMPT, &pairs)
}

pub fn intake_prompt(document_text: &str) -> String {
    fill(INTAKE_PROMPT, &[("document_text", document_text)])
}
