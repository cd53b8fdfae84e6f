
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{char, space0, space1, u32 as decimal_u32};
use nom::combinator::{map_res, peek};
use nom::multi::many0;
use nom::sequence::{preceded, terminated};
use nom::IResult;
use std::str::FromStr;
use crate::types::*;


fn parse_modifier(smali: &str) -> IResult<&str, Modifier>
{
    map_res(
        alt(( tag("public"),
              tag("protected"),
              tag("private"),
              tag("static"),
              tag("final"),
              tag("abstract"),
              tag("interface"),
              tag("synthetic"),
              tag("transient"),
              tag("volatile"),
              tag("synchronized"),
              tag("declared-synchronized"),
              tag("native"),
              tag("varargs"),
              tag("annotation"),
              tag("enum"),
              tag("strict"),
              tag("bridge"),
              tag("constructor")
        )),
        Modifier::from_str
    )(smali)
}

/* A modifier only counts when followed by more header text, so a method named `finalize` stays a name */
fn parse_modifiers(smali: &str) -> IResult<&str, Vec<Modifier>>
{
    many0(preceded(space1, terminated(parse_modifier, peek(space1))))(smali)
}

pub(crate) fn parse_method_header(smali: &str) -> IResult<&str, MethodHeader>
{
    let (input, _) = preceded(space0, tag(".method"))(smali)?;
    let (input, modifiers) = parse_modifiers(input)?;
    let (input, name) = preceded(space1, take_while1(|c: char| c != '(' && !c.is_whitespace()))(input)?;
    let (input, _) = peek(char('('))(input)?;
    let (input, descriptor) = take_while1(|c: char| !c.is_whitespace())(input)?;
    let (input, _) = space0(input)?;

    Ok((input, MethodHeader {
        modifiers,
        name: name.to_string(),
        descriptor: descriptor.to_string(),
    }))
}

pub(crate) fn parse_register_directive(smali: &str) -> IResult<&str, u32>
{
    let (input, _) = preceded(space0, alt((tag(".locals"), tag(".registers"))))(smali)?;
    preceded(space1, decimal_u32)(input)
}

fn is_method_start(line: &str) -> bool
{
    match line.trim_start().strip_prefix(".method") {
        Some(rest) => rest.is_empty() || rest.starts_with(char::is_whitespace),
        None => false,
    }
}

fn is_method_end(line: &str) -> bool
{
    line.trim() == METHOD_TERMINATOR
}

/* Splits raw text into lines, each keeping the ending it had; the last one has none when the text does not end with a newline */
fn split_lines(smali: &str) -> Vec<SmaliLine>
{
    smali
        .split_inclusive('\n')
        .map(|piece| {
            if let Some(text) = piece.strip_suffix("\r\n") {
                SmaliLine::with_ending(text, Some(LineEnding::CrLf))
            } else if let Some(text) = piece.strip_suffix('\n') {
                SmaliLine::with_ending(text, Some(LineEnding::Lf))
            } else {
                SmaliLine::with_ending(piece, None)
            }
        })
        .collect()
}

/* The ending most lines use, LF on a tie */
fn dominant_line_ending(lines: &[SmaliLine]) -> LineEnding
{
    let crlf = lines.iter().filter(|l| l.ending == Some(LineEnding::CrLf)).count();
    let lf = lines.iter().filter(|l| l.ending == Some(LineEnding::Lf)).count();
    if crlf > lf { LineEnding::CrLf } else { LineEnding::Lf }
}

pub(crate) fn parse_document(smali: &str) -> SmaliDocument
{
    let lines = split_lines(smali);
    let line_ending = dominant_line_ending(&lines);
    let mut items = vec![];
    let mut current: Option<SmaliMethod> = None;

    for line in lines {
        match current.as_mut() {
            None if is_method_start(&line.text) => current = Some(SmaliMethod::new(line)),
            None => items.push(ClassItem::Line(line)),
            Some(m) if is_method_end(&line.text) => {
                m.terminator = Some(line);
                if let Some(m) = current.take() {
                    items.push(ClassItem::Method(m));
                }
            }
            Some(m) => m.body.push(line),
        }
    }

    // Unterminated method at end of input is kept as is
    if let Some(m) = current {
        items.push(ClassItem::Method(m));
    }

    SmaliDocument {
        items,
        line_ending,
        trailing_newline: smali.ends_with('\n'),
        file_path: None,
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_header() {
        let (rest, h) = parse_method_header(".method public static constructor <clinit>()V").unwrap();
        assert_eq!(rest, "");
        assert_eq!(h.name, "<clinit>");
        assert_eq!(h.descriptor, "()V");
        assert_eq!(h.modifiers, vec![Modifier::Public, Modifier::Static, Modifier::Constructor]);
        assert!(h.is_static_initializer());
    }

    #[test]
    fn method_header_name_looks_like_modifier() {
        let (_, h) = parse_method_header(".method protected finalize()V").unwrap();
        assert_eq!(h.name, "finalize");
        assert_eq!(h.modifiers, vec![Modifier::Protected]);

        let (_, h) = parse_method_header("    .method private declared-synchronized run(Ljava/lang/String;I)Z").unwrap();
        assert_eq!(h.name, "run");
        assert_eq!(h.descriptor, "(Ljava/lang/String;I)Z");
        assert_eq!(h.modifiers, vec![Modifier::Private, Modifier::DeclaredSynchronized]);
    }

    #[test]
    fn method_header_rejects_garbage() {
        assert!(parse_method_header(".method").is_err());
        assert!(parse_method_header(".method public static").is_err());
        assert!(parse_method_header(".field public static x:I").is_err());
    }

    #[test]
    fn register_directive() {
        assert_eq!(parse_register_directive("    .locals 3").unwrap().1, 3);
        assert_eq!(parse_register_directive("    .registers 1").unwrap().1, 1);
        assert!(parse_register_directive("    const/4 v0, 0x0").is_err());
    }

    #[test]
    fn document_methods_and_lines() {
        let smali = ".class public Lcom/a/B;\n.super Ljava/lang/Object;\n\n.method public constructor <init>()V\n    .locals 0\n    return-void\n.end method\n";
        let doc = parse_document(smali);
        assert_eq!(doc.items.len(), 4);
        let m = doc.methods().next().unwrap();
        assert_eq!(m.header.as_ref().map(|h| h.name.as_str()), Some("<init>"));
        assert_eq!(m.body, vec!["    .locals 0", "    return-void"]);
        assert_eq!(m.terminator.as_ref().map(SmaliLine::as_str), Some(".end method"));
        assert!(doc.trailing_newline);
    }

    #[test]
    fn unterminated_method_is_kept() {
        let smali = ".class public La;\n.method static constructor <clinit>()V\n    return-void";
        let doc = parse_document(smali);
        let m = doc.methods().next().unwrap();
        assert!(m.terminator.is_none());
        assert!(!doc.trailing_newline);
        assert_eq!(doc.to_smali(), smali);
    }

    #[test]
    fn crlf_is_detected() {
        let doc = parse_document(".class La;\r\n.super Ljava/lang/Object;\r\n");
        assert_eq!(doc.line_ending, LineEnding::CrLf);
        assert_eq!(doc.lines().collect::<Vec<_>>(), vec![".class La;", ".super Ljava/lang/Object;"]);
    }

    #[test]
    fn endings_are_kept_per_line() {
        let doc = parse_document(".class public La;\r\n.super Ljava/lang/Object;\n# lf only\n.source \"a\"");
        let endings: Vec<Option<LineEnding>> = doc.entries().map(|l| l.ending).collect();
        assert_eq!(
            endings,
            vec![Some(LineEnding::CrLf), Some(LineEnding::Lf), Some(LineEnding::Lf), None]
        );
        assert_eq!(doc.line_ending, LineEnding::Lf);
        assert!(!doc.trailing_newline);
    }
}
