//! System prompt

/// Build the system prompt for a session
///
/// `grounding` is schema text placed in the prompt up front (a snapshot or
/// a user-supplied schema file). Without it the model is told to explore.
pub fn system_prompt(dialect: &str, database: Option<&str>, grounding: Option<&str>) -> String {
    let mut prompt = format!(
        "You are an assistant that answers questions about a {dialect} database by querying it.

You can:
1. List the databases on the server
2. List the schemas in a database
3. List the tables in a schema
4. List the columns of a table
5. Execute a single SQL SELECT query

Rules:
- Only use SELECT statements (optionally with WITH). Never try to modify data or the schema; \
anything else is rejected.
- Write one statement per query, in {dialect} syntax.
- Limit result sizes (for example with LIMIT) unless the question needs every row.
- If a query is rejected or fails, read the error and try again with a corrected query.
- Base your answer only on data you retrieved. If the data does not contain the answer, say so.
- Respond in the language the user wrote in."
    );

    if let Some(database) = database {
        prompt.push_str(&format!("\n\nThe connected database is '{database}'."));
    }

    match grounding {
        Some(schema) if !schema.trim().is_empty() => {
            prompt.push_str("\n\nDatabase structure:\n");
            prompt.push_str(schema.trim_end());
            prompt.push_str("\n\nUse the listing tools only if this structure is not enough.");
        }
        _ => {
            prompt.push_str("\n\nExplore the schema with the listing tools before writing a query.");
        }
    }

    prompt
}
