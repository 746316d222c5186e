//! Centralized prompt definitions for the research steps
//!
//! Placeholders use `{name}` and are filled in by [`render`]. The same text
//! is installed as the pipe's system message and sent per request, so the
//! pipe works whether or not it was provisioned by this server.

/// Prompt for the query generation step.
pub const QUERY_WRITER_PROMPT: &str = r#"You are a search query generator tasked with creating targeted search queries to gather specific company information.

Here is the company you are researching: {company}

Generate at most {max_search_queries} search queries that will help gather the following information:

<schema>
{info}
</schema>

<user_notes>
{user_notes}
</user_notes>

Your query should:
1. Focus on finding factual, up-to-date company information
2. Target official sources, news, and reliable business databases
3. Prioritize finding information that matches the schema requirements
4. Include the company name and relevant business terms
5. Be specific enough to avoid irrelevant results

Create a focused query that will maximize the chances of finding schema-relevant information."#;

/// Prompt for the note synthesis step.
pub const NOTES_PROMPT: &str = r#"You are doing web research on a company, {company}.

The following schema shows the type of information we're interested in:

<schema>
{info}
</schema>

You have just scraped website content. Your task is to take clear, organized notes about the company, focusing on topics relevant to our interests.

<website_contents>
{content}
</website_contents>

Here are any additional notes from the user:
<user_notes>
{user_notes}
</user_notes>

Please provide detailed research notes that:
1. Are well-organized and easy to read
2. Focus on topics mentioned in the schema
3. Include specific facts, dates, and figures when available
4. Maintain accuracy of the original content
5. Note when important information appears to be missing or unclear

Remember: Don't try to format the output to match the schema - just take clear notes that capture all relevant information."#;

/// Prompt for the schema extraction step.
pub const EXTRACTION_PROMPT: &str = r#"Your task is to take notes gathered from web research and extract them into the following schema.

<schema>
{info}
</schema>

Here are all the notes from research:

<web_research_notes>
{notes}
</web_research_notes>"#;

/// Prompt for the reflection step.
pub const REFLECTION_PROMPT: &str = r#"You are a research analyst tasked with reviewing the quality and completeness of extracted company information.

Compare the extracted information with the required schema:

<Schema>
{schema}
</Schema>

Here is the extracted information:
<extracted_info>
{info}
</extracted_info>

Analyze if all required fields are present and sufficiently populated:
1. Check each required field
2. Identify any missing or incomplete information
3. Assess data quality and completeness
4. Provide specific search queries for missing information (at most 3)"#;

/// User turn sent with each step.
pub const QUERY_WRITER_INSTRUCTION: &str =
    "Please generate a list of search queries related to the schema that you want to populate.";
/// User turn sent with the note synthesis step.
pub const NOTES_INSTRUCTION: &str = "Please provide detailed research notes.";
/// User turn sent with the extraction step.
pub const EXTRACTION_INSTRUCTION: &str = "Produce a structured output from these notes.";
/// User turn sent with the reflection step.
pub const REFLECTION_INSTRUCTION: &str = "Produce a structured reflection output.";

/// Fill `{name}` placeholders in a prompt template.
///
/// Unknown placeholders are left untouched.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{}}}", key), value);
    }
    out
}
