//! Command references: `controller[.instrument].command[(arg,...)]`.

/// A parsed device command reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandRef<'a> {
    /// Path segments split on the configured delimiter
    pub segments: Vec<&'a str>,
    /// Call-form arguments, if the entry used `name(arg,...)`
    pub args: Option<Vec<&'a str>>,
}

impl<'a> CommandRef<'a> {
    /// Parse `entry`. Returns `None` when the path has fewer than two segments.
    pub fn parse(entry: &'a str, delimiter: &str) -> Option<Self> {
        let trimmed = entry.trim_end_matches(')');
        let (path, args) = match trimmed.split_once('(') {
            Some((path, args)) => (path, Some(args.split(',').collect())),
            None => (entry, None),
        };
        let segments: Vec<&str> = path.split(delimiter).collect();
        if segments.len() < 2 {
            return None;
        }
        Some(Self { segments, args })
    }

    /// Controller name.
    pub fn controller(&self) -> &'a str {
        self.segments[0]
    }

    /// Instrument name, for three-segment paths.
    pub fn instrument(&self) -> Option<&'a str> {
        (self.segments.len() > 2).then(|| self.segments[1])
    }

    /// Command name.
    pub fn command(&self) -> &'a str {
        if self.segments.len() > 2 {
            self.segments[2]
        } else {
            self.segments[1]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_level_reference() {
        let r = CommandRef::parse("gpib0.ver", ".").unwrap();
        assert_eq!(r.controller(), "gpib0");
        assert_eq!(r.instrument(), None);
        assert_eq!(r.command(), "ver");
        assert!(r.args.is_none());
    }

    #[test]
    fn instrument_call_form() {
        let r = CommandRef::parse("gpib0.psu.volt(5.000, 1)", ".").unwrap();
        assert_eq!(r.instrument(), Some("psu"));
        assert_eq!(r.command(), "volt");
        assert_eq!(r.args, Some(vec!["5.000", " 1"]));
    }

    #[test]
    fn single_segment_is_not_a_reference() {
        assert!(CommandRef::parse("noop", ".").is_none());
        assert!(CommandRef::parse("gpib0/ver", ".").is_none());
        assert!(CommandRef::parse("gpib0/ver", "/").is_some());
    }
}
