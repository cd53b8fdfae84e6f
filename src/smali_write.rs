use crate::types::SmaliDocument;

/* Lines read from text keep their own ending, lines added in memory get the dominant one */
pub(crate) fn write_document(doc: &SmaliDocument) -> String
{
    let dominant = doc.line_ending.as_str();
    let mut out = String::new();
    let mut lines = doc.entries().peekable();

    while let Some(line) = lines.next()
    {
        out.push_str(&line.text);
        match line.ending {
            Some(ending) => out.push_str(ending.as_str()),
            None if lines.peek().is_some() || doc.trailing_newline => out.push_str(dominant),
            None => {}
        }
    }

    out
}
