use ormscope_domain::SourceAttribution;
use ormscope_host::{CallFrame, UnitId};

/// Map a call stack onto a line of the active script.
///
/// Frames are walked innermost first. The first frame executing inside
/// `unit` at a line within `source_lines` wins; its line and the trimmed
/// text of that line are returned. Anything else yields an empty
/// attribution.
#[must_use]
pub fn resolve<S: AsRef<str>>(
    stack: &[CallFrame],
    unit: UnitId,
    source_lines: &[S],
) -> SourceAttribution {
    stack
        .iter()
        .rev()
        .filter(|frame| frame.unit == unit)
        .find_map(|frame| {
            let text = frame
                .line
                .checked_sub(1)
                .and_then(|index| source_lines.get(index))?;
            Some(SourceAttribution {
                line: Some(frame.line),
                context: Some(text.as_ref().trim().to_string()),
            })
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use ormscope_host::{CallFrame, UnitId, UnitKind};

    use super::resolve;

    fn frame(unit: u64, function: &str, line: usize) -> CallFrame {
        CallFrame {
            unit: UnitId(unit),
            kind: UnitKind::Script,
            function: function.to_string(),
            line,
        }
    }

    const SOURCE: [&str; 3] = ["x = 1", "def run():", "    Person.objects.create(name=\"Ada\")"];

    #[test]
    fn innermost_matching_frame_wins() {
        let stack = vec![
            frame(7, "<module>", 2),
            frame(1, "helper", 40),
            frame(7, "run", 3),
            frame(2, "save", 12),
        ];
        let attribution = resolve(&stack, UnitId(7), &SOURCE);
        assert_eq!(attribution.line, Some(3));
        assert_eq!(
            attribution.context.as_deref(),
            Some("Person.objects.create(name=\"Ada\")")
        );
    }

    #[test]
    fn frames_outside_the_unit_or_range_are_skipped() {
        assert!(resolve(&[frame(1, "<module>", 2)], UnitId(7), &SOURCE).is_empty());
        assert!(resolve(&[frame(7, "<module>", 0)], UnitId(7), &SOURCE).is_empty());
        assert!(resolve(&[frame(7, "<module>", 9)], UnitId(7), &SOURCE).is_empty());

        let fallback = resolve(
            &[frame(7, "<module>", 1), frame(7, "run", 99)],
            UnitId(7),
            &SOURCE,
        );
        assert_eq!(fallback.line, Some(1));
        assert!(resolve::<&str>(&[], UnitId(7), &[]).is_empty());
    }
}
