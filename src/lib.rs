//! Document model and structural edit engine for Org outline files.
//!
//! The document is a single ordered sequence of headers carrying an explicit
//! nesting level; the tree the user sees is derived from that sequence, never
//! stored. Every edit is a pure transform from one document value to the
//! next, and an undo history snapshots the document around dirtying edits.

pub mod core {
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    /* ------------------------------- IDs ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct HeaderId(pub Uuid);

    impl HeaderId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct TimestampId(pub Uuid);

    impl TimestampId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct TableCellId(pub Uuid);

    impl TableCellId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ListItemId(pub Uuid);

    impl ListItemId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct PlanningItemId(pub Uuid);

    impl PlanningItemId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct PropertyListItemId(pub Uuid);

    impl PropertyListItemId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct LogEntryId(pub Uuid);

    impl LogEntryId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    /* ----------------------------- Timestamps ----------------------------- */

    /// A calendar offset in a single unit, as written in repeater and delay
    /// cookies (`+1w`, `-2d`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DateOffset {
        pub value: u32,
        pub unit: OffsetUnit,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum OffsetUnit {
        Hour,
        Day,
        Week,
        Month,
        Year,
    }

    impl OffsetUnit {
        pub fn suffix(&self) -> char {
            match self {
                OffsetUnit::Hour => 'h',
                OffsetUnit::Day => 'd',
                OffsetUnit::Week => 'w',
                OffsetUnit::Month => 'm',
                OffsetUnit::Year => 'y',
            }
        }
    }

    /// `+` (shift one interval), `++` (shift until the result is in the
    /// future), `.+` (shift from the completion time).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum RepeaterKind {
        FromLast, // `+`
        FromBase, // `++`
        FromNow,  // `.+`
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Repeater {
        pub kind: RepeaterKind,
        pub interval: DateOffset,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum DelayKind {
        All,   // `-`
        First, // `--`
    }

    /// Warning/delay cookie such as `-2d`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Delay {
        pub kind: DelayKind,
        pub offset: DateOffset,
    }

    /// One side of a timestamp: date, optional time (and same-day end time),
    /// plus repeater/delay cookies.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TimestampPart {
        pub date: NaiveDate,
        pub time: Option<NaiveTime>,
        pub end_time: Option<NaiveTime>,
        pub repeater: Option<Repeater>,
        pub delay: Option<Delay>,
    }

    impl TimestampPart {
        pub fn date_only(date: NaiveDate) -> Self {
            Self {
                date,
                time: None,
                end_time: None,
                repeater: None,
                delay: None,
            }
        }

        pub fn at(date: NaiveDate, time: NaiveTime) -> Self {
            Self {
                time: Some(time),
                ..Self::date_only(date)
            }
        }

        /// Resolved start instant; date-only parts resolve to midnight.
        pub fn datetime(&self) -> NaiveDateTime {
            let time = self
                .time
                .unwrap_or_else(|| NaiveTime::from_hms_opt(0, 0, 0).unwrap());
            NaiveDateTime::new(self.date, time)
        }
    }

    /// A timestamp occurrence. Carries its own id so it can be replaced in
    /// place wherever it appears (title content, description content,
    /// planning items, log entries).
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Timestamp {
        pub id: TimestampId,
        /// `<...>` when true, `[...]` when false.
        pub active: bool,
        pub first: TimestampPart,
        pub second: Option<TimestampPart>,
    }

    impl Timestamp {
        pub fn from_part(active: bool, first: TimestampPart) -> Self {
            Self {
                id: TimestampId::new(),
                active,
                first,
                second: None,
            }
        }

        pub fn on_date(date: NaiveDate, active: bool) -> Self {
            Self::from_part(active, TimestampPart::date_only(date))
        }

        pub fn at(date: NaiveDate, time: NaiveTime, active: bool) -> Self {
            Self::from_part(active, TimestampPart::at(date, time))
        }
    }

    /* ------------------------- Header sub-structures ------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
    pub enum PlanningKind {
        Scheduled,
        Deadline,
        Closed,
    }

    impl PlanningKind {
        pub fn label(&self) -> &'static str {
            match self {
                PlanningKind::Scheduled => "SCHEDULED",
                PlanningKind::Deadline => "DEADLINE",
                PlanningKind::Closed => "CLOSED",
            }
        }

        /// Canonical position on the planning line.
        pub fn rank(&self) -> u8 {
            match self {
                PlanningKind::Scheduled => 0,
                PlanningKind::Deadline => 1,
                PlanningKind::Closed => 2,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PlanningItem {
        pub id: PlanningItemId,
        pub kind: PlanningKind,
        pub timestamp: Timestamp,
    }

    impl PlanningItem {
        pub fn new(kind: PlanningKind, timestamp: Timestamp) -> Self {
            Self {
                id: PlanningItemId::new(),
                kind,
                timestamp,
            }
        }
    }

    /// One CLOCK line in the logbook drawer.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct LogBookEntry {
        pub id: LogEntryId,
        pub start: Timestamp,
        pub end: Option<Timestamp>,
    }

    /// Which side of a log entry an update addresses.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum LogTimeField {
        Start,
        End,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PropertyListItem {
        pub id: PropertyListItemId,
        pub property: String,
        pub value: Option<String>,
    }

    impl PropertyListItem {
        pub fn new(property: impl Into<String>, value: Option<String>) -> Self {
            Self {
                id: PropertyListItemId::new(),
                property: property.into(),
                value,
            }
        }
    }

    /* ---------------------------- Content model ---------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum CheckboxState {
        Checked,
        Unchecked,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ListItem {
        pub id: ListItemId,
        /// Leading whitespace, kept verbatim for round-tripping.
        pub indent: String,
        /// The bullet as written (`-`, `+`, `1.`, `1)`).
        pub bullet: String,
        pub checkbox: Option<CheckboxState>,
        pub raw_contents: String,
        pub contents: Vec<ContentNode>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct List {
        pub items: Vec<ListItem>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TableCell {
        pub id: TableCellId,
        pub contents: Vec<ContentNode>,
        pub raw_contents: String,
    }

    impl TableCell {
        pub fn empty() -> Self {
            Self {
                id: TableCellId::new(),
                contents: vec![],
                raw_contents: String::new(),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct TableRow {
        pub cells: Vec<TableCell>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Table {
        pub rows: Vec<TableRow>,
    }

    /// A description (or title) fragment. `Text` spans are verbatim source
    /// text, which is what keeps untouched regions byte-identical on
    /// reserialization.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub enum ContentNode {
        Text { raw: String },
        Timestamp(Timestamp),
        Table(Table),
        List(List),
    }

    /* ------------------------------- Headers ------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TitleLine {
        /// Only keywords known to the document's keyword sets end up here;
        /// anything else stays part of the raw title.
        pub todo_keyword: Option<String>,
        /// Single-letter priority from `[#A]`.
        pub priority: Option<char>,
        /// Verbatim title text, including any alignment padding before tags.
        pub raw_title: String,
        /// `raw_title` parsed into content nodes (inline timestamps get ids).
        pub title: Vec<ContentNode>,
        pub tags: Vec<String>,
    }

    impl TitleLine {
        pub fn empty() -> Self {
            Self {
                todo_keyword: None,
                priority: None,
                raw_title: String::new(),
                title: vec![],
                tags: vec![],
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Header {
        pub id: HeaderId,
        /// Depth in the derived tree, >= 1.
        pub nesting_level: usize,
        pub title: TitleLine,
        pub planning_items: Vec<PlanningItem>,
        pub log_book_entries: Vec<LogBookEntry>,
        pub property_list_items: Vec<PropertyListItem>,
        pub description: Vec<ContentNode>,
        /// Serialized form of `description`, recomputed by every edit that
        /// touches description content.
        pub raw_description: String,
    }

    impl Header {
        pub fn new(nesting_level: usize) -> Self {
            Self {
                id: HeaderId::new(),
                nesting_level,
                title: TitleLine::empty(),
                planning_items: vec![],
                log_book_entries: vec![],
                property_list_items: vec![],
                description: vec![],
                raw_description: String::new(),
            }
        }
    }

    /* ----------------------------- Todo keywords ----------------------------- */

    /// One `#+TODO:` sequence; `|` splits active from done-class keywords.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TodoKeywordSet {
        pub active: Vec<String>,
        pub done: Vec<String>,
    }

    impl Default for TodoKeywordSet {
        fn default() -> Self {
            Self {
                active: vec!["TODO".to_string()],
                done: vec!["DONE".to_string()],
            }
        }
    }

    impl TodoKeywordSet {
        pub fn keywords(&self) -> impl Iterator<Item = &str> {
            self.active
                .iter()
                .chain(self.done.iter())
                .map(String::as_str)
        }

        pub fn contains(&self, keyword: &str) -> bool {
            self.keywords().any(|k| k == keyword)
        }

        pub fn is_done(&self, keyword: &str) -> bool {
            self.done.iter().any(|k| k == keyword)
        }

        pub fn first_active(&self) -> Option<&str> {
            self.active.first().map(String::as_str)
        }

        /// Cycle `none -> active... -> done... -> none`.
        pub fn next_keyword(&self, current: Option<&str>) -> Option<String> {
            let all: Vec<&str> = self.keywords().collect();
            match current {
                None => all.first().map(|k| k.to_string()),
                Some(cur) => match all.iter().position(|k| *k == cur) {
                    Some(pos) if pos + 1 < all.len() => Some(all[pos + 1].to_string()),
                    Some(_) => None,
                    None => all.first().map(|k| k.to_string()),
                },
            }
        }
    }

    /// Per-document settings read from `#+KEY: value` preamble lines.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DocumentSettings {
        pub keyword_sets: Vec<TodoKeywordSet>,
        /// Other `#+KEY` lines, in file order.
        #[serde(default)]
        pub meta: IndexMap<String, String>,
    }

    impl Default for DocumentSettings {
        fn default() -> Self {
            Self {
                keyword_sets: vec![TodoKeywordSet::default()],
                meta: IndexMap::new(),
            }
        }
    }

    impl DocumentSettings {
        /// The keyword set a header cycles through: the one containing its
        /// current keyword, else the first configured set.
        pub fn set_for(&self, keyword: Option<&str>) -> &TodoKeywordSet {
            if let Some(kw) = keyword {
                if let Some(set) = self.keyword_sets.iter().find(|s| s.contains(kw)) {
                    return set;
                }
            }
            &self.keyword_sets[0]
        }
    }

    /* ------------------------------- Document ------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Document {
        /// Verbatim text before the first header.
        pub preamble: String,
        pub settings: DocumentSettings,
        pub headers: Vec<Header>,
        /// Selection/focus pass-through state; mutated only by transient ops.
        pub selected_header_id: Option<HeaderId>,
        pub focused_header_id: Option<HeaderId>,
        pub selected_table_cell_id: Option<TableCellId>,
    }

    impl Document {
        pub fn empty() -> Self {
            Self {
                preamble: String::new(),
                settings: DocumentSettings::default(),
                headers: vec![],
                selected_header_id: None,
                focused_header_id: None,
                selected_table_cell_id: None,
            }
        }

        pub fn header_position(&self, id: HeaderId) -> Option<usize> {
            self.headers.iter().position(|h| h.id == id)
        }

        /// A header's subtree: itself plus the maximal contiguous run of
        /// strictly deeper-nested headers that follows it. Every structural
        /// operation derives its boundaries from this one rule.
        pub fn subtree_span(&self, index: usize) -> std::ops::Range<usize> {
            let level = self.headers[index].nesting_level;
            let mut end = index + 1;
            while end < self.headers.len() && self.headers[end].nesting_level > level {
                end += 1;
            }
            index..end
        }
    }

    /* ------------------------------- Errors ------------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum ParseError {
        #[error("input is not text")]
        NotText,
        #[error("malformed document: {0}")]
        Malformed(String),
    }

    /// Edits never panic on expected edge cases; they distinguish "applied"
    /// from "no-op with reason".
    #[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
    pub enum EditError {
        #[error("no node with the requested id or index")]
        NotFound,
        #[error("{0}")]
        InvalidTransition(&'static str),
        #[error("nothing to undo or redo")]
        HistoryUnderflow,
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::NaiveDate;

        #[test]
        fn subtree_span_covers_deeper_run() {
            let mut doc = Document::empty();
            for level in [1, 2, 3, 2, 1] {
                doc.headers.push(Header::new(level));
            }
            assert_eq!(doc.subtree_span(0), 0..4);
            assert_eq!(doc.subtree_span(1), 1..3);
            assert_eq!(doc.subtree_span(2), 2..3);
            assert_eq!(doc.subtree_span(4), 4..5);
        }

        #[test]
        fn keyword_set_cycles_through_none() {
            let set = TodoKeywordSet::default();
            assert_eq!(set.next_keyword(None), Some("TODO".to_string()));
            assert_eq!(set.next_keyword(Some("TODO")), Some("DONE".to_string()));
            assert_eq!(set.next_keyword(Some("DONE")), None);
        }

        #[test]
        fn settings_pick_the_set_containing_the_keyword() {
            let mut settings = DocumentSettings::default();
            settings.keyword_sets.push(TodoKeywordSet {
                active: vec!["START".into(), "INPROGRESS".into()],
                done: vec!["FINISHED".into()],
            });
            assert!(settings.set_for(Some("FINISHED")).is_done("FINISHED"));
            assert_eq!(settings.set_for(Some("TODO")).first_active(), Some("TODO"));
            assert_eq!(settings.set_for(None).first_active(), Some("TODO"));
        }

        #[test]
        fn date_only_parts_resolve_to_midnight() {
            let part = TimestampPart::date_only(NaiveDate::from_ymd_opt(2020, 4, 5).unwrap());
            assert_eq!(
                part.datetime().time(),
                NaiveTime::from_hms_opt(0, 0, 0).unwrap()
            );
        }
    }
}

pub mod parser {
    //! Tolerant, line-oriented parser built on `nom`.
    //!
    //! The top-level scan walks lines, producing the flat header sequence;
    //! headlines, planning lines, drawers and timestamps are parsed with
    //! small combinators. Anything that does not parse stays in the document
    //! as verbatim text, so malformed spans never abort the parse.

    use crate::core::*;
    use chrono::{NaiveDate, NaiveTime};
    use indexmap::IndexMap;
    use nom::{
        IResult,
        bytes::complete::{tag, take_while, take_while1},
        character::complete::{anychar, char, space0},
        combinator::{map, map_res, rest},
        error::{VerboseError, VerboseErrorKind},
        sequence::{delimited, tuple},
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /* ------------------------ Public entry points ------------------------ */

    /// Parse a whole document. Fresh ids are assigned to every addressable
    /// node in this single pass.
    pub fn parse_document(input: &str) -> Result<Document, ParseError> {
        parse_with_settings(input, &DocumentSettings::default())
    }

    /// Parse `input` against an existing document's settings (used when
    /// splicing captured content into a parsed document, so its todo
    /// keywords are recognized).
    pub fn parse_with_settings(
        input: &str,
        baseline: &DocumentSettings,
    ) -> Result<Document, ParseError> {
        if input.contains('\0') {
            return Err(ParseError::NotText);
        }

        let lines = lines_with_endings(input);
        let mut doc = Document::empty();
        let mut settings = DocumentSettings {
            keyword_sets: vec![],
            meta: IndexMap::new(),
        };

        let mut i = 0;
        let mut preamble = String::new();
        while i < lines.len() && !is_heading_line(lines[i]) {
            if let Ok((_, (key, value))) = parse_meta_line(strip_newline(lines[i])) {
                if key.eq_ignore_ascii_case("todo") || key.eq_ignore_ascii_case("seq_todo") {
                    settings.keyword_sets.push(parse_todo_sequence(value));
                } else {
                    settings
                        .meta
                        .insert(key.to_ascii_lowercase(), value.trim().to_string());
                }
            }
            preamble.push_str(lines[i]);
            i += 1;
        }
        if settings.keyword_sets.is_empty() {
            settings.keyword_sets = baseline.keyword_sets.clone();
        }
        doc.preamble = preamble;

        while i < lines.len() {
            let (header, next) = parse_header(&lines, i, &settings);
            doc.headers.push(header);
            i = next;
        }
        doc.settings = settings;
        Ok(doc)
    }

    /* ------------------------------ Headers ------------------------------ */

    fn parse_header(lines: &[&str], start: usize, settings: &DocumentSettings) -> (Header, usize) {
        let (level, title) = parse_headline(strip_newline(lines[start]), settings);
        let mut header = Header::new(level);
        header.title = title;
        let mut i = start + 1;

        // Planning lines sit directly under the headline.
        while i < lines.len() && !is_heading_line(lines[i]) {
            match parse_planning_line(strip_newline(lines[i])) {
                Some(items) => {
                    header.planning_items.extend(items);
                    i += 1;
                }
                None => break,
            }
        }
        if let Some((props, next)) = try_parse_properties(lines, i) {
            header.property_list_items = props;
            i = next;
        }
        if let Some((entries, next)) = try_parse_logbook(lines, i) {
            header.log_book_entries = entries;
            i = next;
        }

        let mut body_end = i;
        while body_end < lines.len() && !is_heading_line(lines[body_end]) {
            body_end += 1;
        }
        header.raw_description = lines[i..body_end].concat();
        header.description = parse_description(&lines[i..body_end]);
        (header, body_end)
    }

    fn parse_headline(line: &str, settings: &DocumentSettings) -> (usize, TitleLine) {
        let stars = line.chars().take_while(|c| *c == '*').count();
        let mut text = &line[stars..];
        text = text.strip_prefix(' ').unwrap_or(text);

        let mut title_line = TitleLine::empty();

        // Longest configured keyword first so a keyword never shadows a
        // longer one that it prefixes.
        let mut keywords: Vec<&str> = settings
            .keyword_sets
            .iter()
            .flat_map(|s| s.keywords())
            .collect();
        keywords.sort_by_key(|k| std::cmp::Reverse(k.len()));
        for keyword in keywords {
            if let Some(after) = text.strip_prefix(keyword) {
                if after.is_empty() || after.starts_with(' ') {
                    title_line.todo_keyword = Some(keyword.to_string());
                    text = after.strip_prefix(' ').unwrap_or(after);
                    break;
                }
            }
        }

        if let Ok((after, priority)) = parse_priority(text) {
            title_line.priority = Some(priority);
            text = after.strip_prefix(' ').unwrap_or(after);
        }

        let (raw_title, tags) = split_trailing_tags(text);
        title_line.raw_title = raw_title.to_string();
        title_line.tags = tags;
        title_line.title = parse_inline_nodes(raw_title);
        (stars.max(1), title_line)
    }

    /// Split a trailing `:tag1:tag2:` group off the title, keeping any
    /// alignment padding inside the returned title text.
    fn split_trailing_tags(text: &str) -> (&str, Vec<String>) {
        let trimmed = text.trim_end();
        if !trimmed.ends_with(':') {
            return (text, vec![]);
        }
        let tag_start = match trimmed.rfind(|c: char| c.is_whitespace()) {
            Some(pos) => pos + 1,
            None => return (text, vec![]),
        };
        let candidate = &trimmed[tag_start..];
        if !candidate.starts_with(':') || candidate.len() < 3 {
            return (text, vec![]);
        }
        let inner: Vec<&str> = candidate[1..candidate.len() - 1].split(':').collect();
        if inner
            .iter()
            .any(|t| t.is_empty() || !t.chars().all(is_tag_char))
        {
            return (text, vec![]);
        }
        (
            &text[..tag_start],
            inner.iter().map(|t| t.to_string()).collect(),
        )
    }

    fn is_tag_char(c: char) -> bool {
        c.is_alphanumeric() || matches!(c, '_' | '-' | '@' | '#' | '%' | '+')
    }

    /* ------------------------- Planning & drawers ------------------------- */

    fn parse_planning_line(line: &str) -> Option<Vec<PlanningItem>> {
        let mut text = line.trim_start();
        let mut items = Vec::new();
        while !text.is_empty() {
            let (kind, after) = if let Some(r) = text.strip_prefix("SCHEDULED:") {
                (PlanningKind::Scheduled, r)
            } else if let Some(r) = text.strip_prefix("DEADLINE:") {
                (PlanningKind::Deadline, r)
            } else if let Some(r) = text.strip_prefix("CLOSED:") {
                (PlanningKind::Closed, r)
            } else {
                return None;
            };
            let after = after.trim_start();
            let (consumed, timestamp) = scan_timestamp(after)?;
            items.push(PlanningItem::new(kind, timestamp));
            text = after[consumed..].trim_start();
        }
        if items.is_empty() { None } else { Some(items) }
    }

    fn try_parse_properties(lines: &[&str], start: usize) -> Option<(Vec<PropertyListItem>, usize)> {
        if start >= lines.len() || strip_newline(lines[start]).trim() != ":PROPERTIES:" {
            return None;
        }
        let mut items = Vec::new();
        let mut i = start + 1;
        while i < lines.len() {
            let line = strip_newline(lines[i]);
            if line.trim() == ":END:" {
                return Some((items, i + 1));
            }
            if is_heading_line(lines[i]) {
                return None;
            }
            let (_, (key, value)) = parse_property_line(line).ok()?;
            let value = value.trim();
            items.push(PropertyListItem::new(
                key,
                if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                },
            ));
            i += 1;
        }
        None
    }

    fn parse_property_line(i: &str) -> PResult<'_, (&str, &str)> {
        //  :KEY: value
        map(
            tuple((
                space0,
                char(':'),
                take_while1(|c: char| c.is_alphanumeric() || c == '_' || c == '-'),
                char(':'),
                rest,
            )),
            |(_, _, key, _, value)| (key, value),
        )(i)
    }

    fn try_parse_logbook(lines: &[&str], start: usize) -> Option<(Vec<LogBookEntry>, usize)> {
        if start >= lines.len() || strip_newline(lines[start]).trim() != ":LOGBOOK:" {
            return None;
        }
        let mut entries = Vec::new();
        let mut i = start + 1;
        while i < lines.len() {
            let line = strip_newline(lines[i]);
            if line.trim() == ":END:" {
                return Some((entries, i + 1));
            }
            if is_heading_line(lines[i]) {
                return None;
            }
            entries.push(parse_clock_line(line)?);
            i += 1;
        }
        None
    }

    fn parse_clock_line(line: &str) -> Option<LogBookEntry> {
        // CLOCK: [2020-01-01 Wed 10:00]--[2020-01-01 Wed 11:30] => 1:30
        let text = line.trim_start().strip_prefix("CLOCK:")?.trim_start();
        let (consumed, mut start_ts) = scan_timestamp(text)?;
        // A `[a]--[b]` range scans as one timestamp; a log entry keeps the
        // two sides separately.
        let end = start_ts
            .second
            .take()
            .map(|part| Timestamp::from_part(start_ts.active, part));
        let tail = text[consumed..].trim();
        if !tail.is_empty() {
            let duration = tail.strip_prefix("=>")?.trim();
            let (hours, minutes) = duration.split_once(':')?;
            hours.parse::<u32>().ok()?;
            minutes.parse::<u32>().ok()?;
        }
        Some(LogBookEntry {
            id: LogEntryId::new(),
            start: start_ts,
            end,
        })
    }

    /* ----------------------------- Description ----------------------------- */

    fn parse_description(lines: &[&str]) -> Vec<ContentNode> {
        let mut nodes = Vec::new();
        let mut text = String::new();
        let mut i = 0;
        while i < lines.len() {
            if is_table_line(lines[i]) {
                flush_text(&mut nodes, &mut text);
                let mut rows = Vec::new();
                while i < lines.len() && is_table_line(lines[i]) {
                    rows.push(parse_table_row(strip_newline(lines[i])));
                    i += 1;
                }
                nodes.push(ContentNode::Table(Table { rows }));
                continue;
            }
            if parse_list_item_line(lines[i]).is_some() {
                flush_text(&mut nodes, &mut text);
                let mut items = Vec::new();
                while i < lines.len() {
                    match parse_list_item_line(lines[i]) {
                        Some(item) => {
                            items.push(item);
                            i += 1;
                        }
                        None => break,
                    }
                }
                nodes.push(ContentNode::List(List { items }));
                continue;
            }
            text.push_str(lines[i]);
            i += 1;
        }
        flush_text(&mut nodes, &mut text);
        nodes
    }

    fn flush_text(nodes: &mut Vec<ContentNode>, text: &mut String) {
        if !text.is_empty() {
            nodes.extend(parse_inline_nodes(text));
            text.clear();
        }
    }

    fn is_table_line(line: &str) -> bool {
        let trimmed = line.trim_start();
        // `|-...` separator rules are outside the modeled grid and stay
        // verbatim text.
        trimmed.starts_with('|') && !trimmed.starts_with("|-")
    }

    fn parse_table_row(line: &str) -> TableRow {
        let trimmed = line.trim();
        let inner = trimmed.strip_prefix('|').unwrap_or(trimmed);
        let inner = inner.strip_suffix('|').unwrap_or(inner);
        let cells = inner
            .split('|')
            .map(|raw| {
                let raw = raw.trim();
                TableCell {
                    id: TableCellId::new(),
                    contents: parse_inline_nodes(raw),
                    raw_contents: raw.to_string(),
                }
            })
            .collect();
        TableRow { cells }
    }

    fn parse_list_item_line(line: &str) -> Option<ListItem> {
        let line = strip_newline(line);
        let indent_len = line.len() - line.trim_start().len();
        let (indent, after_indent) = line.split_at(indent_len);
        let (bullet, body) = if let Some(r) = after_indent.strip_prefix("- ") {
            ("-".to_string(), r)
        } else if let Some(r) = after_indent.strip_prefix("+ ") {
            ("+".to_string(), r)
        } else {
            let digits = after_indent
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .count();
            if digits == 0 {
                return None;
            }
            let marker = after_indent[digits..].chars().next()?;
            if (marker != '.' && marker != ')') || !after_indent[digits + 1..].starts_with(' ') {
                return None;
            }
            (
                after_indent[..digits + 1].to_string(),
                &after_indent[digits + 2..],
            )
        };
        let (checkbox, raw) = match body {
            _ if body.starts_with("[ ] ") => (Some(CheckboxState::Unchecked), &body[4..]),
            "[ ]" => (Some(CheckboxState::Unchecked), ""),
            _ if body.starts_with("[X] ") || body.starts_with("[x] ") => {
                (Some(CheckboxState::Checked), &body[4..])
            }
            "[X]" | "[x]" => (Some(CheckboxState::Checked), ""),
            // `[-]` partial state is outside the model; read it as unchecked.
            _ if body.starts_with("[-] ") => (Some(CheckboxState::Unchecked), &body[4..]),
            _ => (None, body),
        };
        Some(ListItem {
            id: ListItemId::new(),
            indent: indent.to_string(),
            bullet,
            checkbox,
            raw_contents: raw.to_string(),
            contents: parse_inline_nodes(raw),
        })
    }

    /* ----------------------------- Inline scan ----------------------------- */

    /// Split a text span into verbatim runs and timestamp nodes.
    pub(crate) fn parse_inline_nodes(text: &str) -> Vec<ContentNode> {
        let mut nodes = Vec::new();
        let mut plain_start = 0;
        let mut idx = 0;
        while idx < text.len() {
            let ch = text[idx..].chars().next().unwrap();
            if ch == '<' || ch == '[' {
                if let Some((consumed, timestamp)) = scan_timestamp(&text[idx..]) {
                    if plain_start < idx {
                        nodes.push(ContentNode::Text {
                            raw: text[plain_start..idx].to_string(),
                        });
                    }
                    nodes.push(ContentNode::Timestamp(timestamp));
                    idx += consumed;
                    plain_start = idx;
                    continue;
                }
            }
            idx += ch.len_utf8();
        }
        if plain_start < text.len() {
            nodes.push(ContentNode::Text {
                raw: text[plain_start..].to_string(),
            });
        }
        nodes
    }

    /// Try to read a timestamp at the start of `input`; returns the byte
    /// length consumed. A `<a>--<b>` range folds into one timestamp.
    pub(crate) fn scan_timestamp(input: &str) -> Option<(usize, Timestamp)> {
        let (open, close) = match input.chars().next()? {
            '<' => ('<', '>'),
            '[' => ('[', ']'),
            _ => return None,
        };
        let end = input.find(close)?;
        let inner = &input[1..end];
        if inner.contains('\n') || inner.contains(open) {
            return None;
        }
        let first = parse_timestamp_part(inner)?;
        let mut consumed = end + 1;
        let mut second = None;
        if let Some(after_dashes) = input[consumed..].strip_prefix("--") {
            if after_dashes.starts_with(open) {
                if let Some(second_end) = after_dashes.find(close) {
                    if let Some(part) = parse_timestamp_part(&after_dashes[1..second_end]) {
                        second = Some(part);
                        consumed += 2 + second_end + 1;
                    }
                }
            }
        }
        Some((
            consumed,
            Timestamp {
                id: TimestampId::new(),
                active: open == '<',
                first,
                second,
            },
        ))
    }

    fn parse_timestamp_part(inner: &str) -> Option<TimestampPart> {
        let mut tokens = inner.split_whitespace();
        let date = match parse_date(tokens.next()?) {
            Ok(("", date)) => date,
            _ => return None,
        };
        let mut part = TimestampPart::date_only(date);
        for token in tokens {
            if let Some((time, end_time)) = parse_time_token(token) {
                part.time = Some(time);
                part.end_time = end_time;
            } else if let Some(repeater) = parse_repeater_token(token) {
                part.repeater = Some(repeater);
            } else if let Some(delay) = parse_delay_token(token) {
                part.delay = Some(delay);
            } else if token.chars().all(|c| c.is_alphabetic()) {
                // day-of-week name; recomputed from the date when rendering
            } else {
                return None;
            }
        }
        Some(part)
    }

    fn parse_time_token(token: &str) -> Option<(NaiveTime, Option<NaiveTime>)> {
        match parse_time(token) {
            Ok(("", time)) => Some((time, None)),
            Ok((after, time)) => {
                let end = after.strip_prefix('-')?;
                match parse_time(end) {
                    Ok(("", end_time)) => Some((time, Some(end_time))),
                    _ => None,
                }
            }
            Err(_) => None,
        }
    }

    fn parse_repeater_token(token: &str) -> Option<Repeater> {
        let (kind, tail) = if let Some(r) = token.strip_prefix("++") {
            (RepeaterKind::FromBase, r)
        } else if let Some(r) = token.strip_prefix(".+") {
            (RepeaterKind::FromNow, r)
        } else if let Some(r) = token.strip_prefix('+') {
            (RepeaterKind::FromLast, r)
        } else {
            return None;
        };
        Some(Repeater {
            kind,
            interval: parse_offset_value(tail)?,
        })
    }

    fn parse_delay_token(token: &str) -> Option<Delay> {
        let (kind, tail) = if let Some(r) = token.strip_prefix("--") {
            (DelayKind::First, r)
        } else if let Some(r) = token.strip_prefix('-') {
            (DelayKind::All, r)
        } else {
            return None;
        };
        Some(Delay {
            kind,
            offset: parse_offset_value(tail)?,
        })
    }

    fn parse_offset_value(text: &str) -> Option<DateOffset> {
        let digits = text.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 || text.len() != digits + 1 {
            return None;
        }
        let value = text[..digits].parse().ok()?;
        let unit = match text.as_bytes()[digits] {
            b'h' => OffsetUnit::Hour,
            b'd' => OffsetUnit::Day,
            b'w' => OffsetUnit::Week,
            b'm' => OffsetUnit::Month,
            b'y' => OffsetUnit::Year,
            _ => return None,
        };
        Some(DateOffset { value, unit })
    }

    /* ------------------------------- Pieces ------------------------------- */

    fn parse_priority(i: &str) -> PResult<'_, char> {
        delimited(tag("[#"), anychar, char(']'))(i)
    }

    fn parse_meta_line(i: &str) -> PResult<'_, (&str, &str)> {
        // #+key: value
        map(
            tuple((
                tag("#+"),
                take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
                tag(":"),
                space0,
                rest,
            )),
            |(_, key, _, _, value)| (key, value),
        )(i)
    }

    fn parse_todo_sequence(value: &str) -> TodoKeywordSet {
        let mut active = Vec::new();
        let mut done = Vec::new();
        let mut seen_divider = false;
        for word in value.split_whitespace() {
            if word == "|" {
                seen_divider = true;
                continue;
            }
            // Strip fast-access selectors like `TODO(t)`.
            let word = match word.find('(') {
                Some(pos) => &word[..pos],
                None => word,
            };
            if word.is_empty() {
                continue;
            }
            if seen_divider {
                done.push(word.to_string());
            } else {
                active.push(word.to_string());
            }
        }
        if !seen_divider && active.len() > 1 {
            // Without a divider the last keyword is the done state.
            let last = active.pop().unwrap();
            done.push(last);
        }
        TodoKeywordSet { active, done }
    }

    fn parse_date(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            tuple((
                map_res(take_while_m_n(4, 4, char_is_digit), |s: &str| {
                    s.parse::<i32>()
                }),
                char('-'),
                map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
                char('-'),
                map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
            )),
            |(y, _, m, _, d)| NaiveDate::from_ymd_opt(y, m, d).ok_or("invalid date"),
        )(i)
    }

    fn parse_time(i: &str) -> PResult<'_, NaiveTime> {
        map_res(
            tuple((
                map_res(take_while_m_n(1, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
                char(':'),
                map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
            )),
            |(h, _, m)| NaiveTime::from_hms_opt(h, m, 0).ok_or("invalid time"),
        )(i)
    }

    fn take_while_m_n<F>(m: usize, n: usize, cond: F) -> impl Fn(&str) -> PResult<'_, &str>
    where
        F: Fn(char) -> bool + Copy,
    {
        move |i: &str| {
            let (i, out) = take_while(cond)(i)?;
            if out.len() < m || out.len() > n {
                Err(nom::Err::Error(VerboseError {
                    errors: vec![(i, VerboseErrorKind::Context("m_n"))],
                }))
            } else {
                Ok((i, out))
            }
        }
    }

    fn char_is_digit(c: char) -> bool {
        c.is_ascii_digit()
    }

    /* ------------------------------- Utils ------------------------------- */

    fn lines_with_endings(input: &str) -> Vec<&str> {
        let mut out = Vec::new();
        let mut text = input;
        while !text.is_empty() {
            match text.find('\n') {
                Some(pos) => {
                    out.push(&text[..=pos]);
                    text = &text[pos + 1..];
                }
                None => {
                    out.push(text);
                    text = "";
                }
            }
        }
        out
    }

    fn strip_newline(line: &str) -> &str {
        line.strip_suffix('\n').unwrap_or(line)
    }

    pub(crate) fn is_heading_line(line: &str) -> bool {
        // A heading starts with one-or-more '*' then at least one space.
        let stars = line.chars().take_while(|c| *c == '*').count();
        stars >= 1 && line[stars..].starts_with(' ')
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::NaiveDate;

        fn date(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).unwrap()
        }

        #[test]
        fn headline_with_keyword_priority_and_tags() {
            let doc = parse_document("* TODO [#A] Ship the report :work:urgent:\n").unwrap();
            let title = &doc.headers[0].title;
            assert_eq!(title.todo_keyword.as_deref(), Some("TODO"));
            assert_eq!(title.priority, Some('A'));
            assert_eq!(title.raw_title, "Ship the report ");
            assert_eq!(title.tags, vec!["work", "urgent"]);
        }

        #[test]
        fn unknown_uppercase_word_stays_in_the_title() {
            let doc = parse_document("** PROJECT Foo\n").unwrap();
            let title = &doc.headers[0].title;
            assert_eq!(title.todo_keyword, None);
            assert_eq!(title.raw_title, "PROJECT Foo");
            assert_eq!(doc.headers[0].nesting_level, 2);
        }

        #[test]
        fn custom_todo_sequence_is_recognized() {
            let doc = parse_document(
                "#+TODO: START INPROGRESS | FINISHED\n* FINISHED All wrapped up\n",
            )
            .unwrap();
            assert_eq!(
                doc.headers[0].title.todo_keyword.as_deref(),
                Some("FINISHED")
            );
            assert!(doc.settings.keyword_sets[0].is_done("FINISHED"));
        }

        #[test]
        fn nesting_levels_follow_the_stars() {
            let doc =
                parse_document("* Top level header\n** A nested header\n*** A deep nested header\n")
                    .unwrap();
            let levels: Vec<usize> = doc.headers.iter().map(|h| h.nesting_level).collect();
            assert_eq!(levels, vec![1, 2, 3]);
        }

        #[test]
        fn planning_line_keeps_item_order() {
            let doc = parse_document(
                "* TODO Errands\nSCHEDULED: <2020-04-05 Sun> DEADLINE: <2020-04-10 Fri>\n",
            )
            .unwrap();
            let items = &doc.headers[0].planning_items;
            assert_eq!(items.len(), 2);
            assert_eq!(items[0].kind, PlanningKind::Scheduled);
            assert_eq!(items[0].timestamp.first.date, date(2020, 4, 5));
            assert_eq!(items[1].kind, PlanningKind::Deadline);
        }

        #[test]
        fn timestamp_cookies_parse() {
            let (consumed, ts) = scan_timestamp("<2020-04-05 Sun 10:00-11:30 ++1w -2d> tail")
                .expect("timestamp");
            assert_eq!(consumed, "<2020-04-05 Sun 10:00-11:30 ++1w -2d>".len());
            assert!(ts.active);
            assert_eq!(ts.first.time.unwrap().format("%H:%M").to_string(), "10:00");
            assert_eq!(
                ts.first.end_time.unwrap().format("%H:%M").to_string(),
                "11:30"
            );
            let repeater = ts.first.repeater.unwrap();
            assert_eq!(repeater.kind, RepeaterKind::FromBase);
            assert_eq!(repeater.interval.value, 1);
            assert_eq!(repeater.interval.unit, OffsetUnit::Week);
            assert_eq!(ts.first.delay.unwrap().kind, DelayKind::All);
        }

        #[test]
        fn timestamp_ranges_fold_into_one_node() {
            let (_, ts) = scan_timestamp("<2020-04-05 Sun>--<2020-04-07 Tue>").expect("range");
            assert_eq!(ts.second.unwrap().date, date(2020, 4, 7));
        }

        #[test]
        fn inline_timestamps_split_text_runs() {
            let doc = parse_document(
                "* Meeting <2020-04-05 Sun 10:00>\nBefore\n\nAt <2020-04-10 Fri> we meet\n",
            )
            .unwrap();
            let header = &doc.headers[0];
            assert!(matches!(header.title.title[0], ContentNode::Text { .. }));
            assert!(matches!(
                header.title.title[1],
                ContentNode::Timestamp(_)
            ));
            assert!(matches!(header.description[0], ContentNode::Text { .. }));
            assert!(matches!(header.description[1], ContentNode::Timestamp(_)));
            assert!(matches!(header.description[2], ContentNode::Text { .. }));
        }

        #[test]
        fn property_drawer_parses_in_order() {
            let doc = parse_document(
                "* With properties\n:PROPERTIES:\n:foo: 1\n:bar: 2\n:baz:\n:END:\nBody\n",
            )
            .unwrap();
            let props = &doc.headers[0].property_list_items;
            let names: Vec<&str> = props.iter().map(|p| p.property.as_str()).collect();
            assert_eq!(names, vec!["foo", "bar", "baz"]);
            assert_eq!(props[0].value.as_deref(), Some("1"));
            assert_eq!(props[2].value, None);
            assert_eq!(doc.headers[0].raw_description, "Body\n");
        }

        #[test]
        fn unterminated_drawer_falls_back_to_text() {
            let doc = parse_document("* Broken\n:PROPERTIES:\n:foo: 1\n").unwrap();
            assert!(doc.headers[0].property_list_items.is_empty());
            assert_eq!(doc.headers[0].raw_description, ":PROPERTIES:\n:foo: 1\n");
        }

        #[test]
        fn logbook_clock_entries_parse() {
            let doc = parse_document(
                "* Clocked\n:LOGBOOK:\nCLOCK: [2020-04-05 Sun 10:00]--[2020-04-05 Sun 11:30] => 1:30\nCLOCK: [2020-04-06 Mon 09:00]\n:END:\n",
            )
            .unwrap();
            let entries = &doc.headers[0].log_book_entries;
            assert_eq!(entries.len(), 2);
            assert!(entries[0].end.is_some());
            assert!(entries[1].end.is_none());
            assert!(!entries[0].start.active);
        }

        #[test]
        fn tables_parse_rows_and_cells() {
            let doc = parse_document(
                "* Books\n| Author | Title |\n| Tolkien | The Hobbit |\n| Herbert | Dune |\n",
            )
            .unwrap();
            let ContentNode::Table(table) = &doc.headers[0].description[0] else {
                panic!("expected a table");
            };
            assert_eq!(table.rows.len(), 3);
            assert_eq!(table.rows[1].cells[0].raw_contents, "Tolkien");
            assert_eq!(table.rows[2].cells[1].raw_contents, "Dune");
        }

        #[test]
        fn table_rule_lines_stay_verbatim_text() {
            let doc = parse_document("* T\n| a | b |\n|---+---|\n| c | d |\n").unwrap();
            let description = &doc.headers[0].description;
            assert!(matches!(description[0], ContentNode::Table(_)));
            assert!(matches!(description[1], ContentNode::Text { .. }));
            assert!(matches!(description[2], ContentNode::Table(_)));
        }

        #[test]
        fn checkbox_lists_parse_states() {
            let doc = parse_document(
                "* Shopping\n- [ ] bread\n- [X] milk\n- [-] cheese\n- plain note\n",
            )
            .unwrap();
            let ContentNode::List(list) = &doc.headers[0].description[0] else {
                panic!("expected a list");
            };
            let states: Vec<Option<CheckboxState>> =
                list.items.iter().map(|i| i.checkbox).collect();
            assert_eq!(
                states,
                vec![
                    Some(CheckboxState::Unchecked),
                    Some(CheckboxState::Checked),
                    Some(CheckboxState::Unchecked),
                    None,
                ]
            );
            assert_eq!(list.items[0].raw_contents, "bread");
        }

        #[test]
        fn garbage_is_kept_as_opaque_text() {
            let input = "* H\n#+BEGIN_WEIRD\n<<not a timestamp>\n#+END_WEIRD\n";
            let doc = parse_document(input).unwrap();
            assert_eq!(doc.headers.len(), 1);
            assert_eq!(
                doc.headers[0].raw_description,
                "#+BEGIN_WEIRD\n<<not a timestamp>\n#+END_WEIRD\n"
            );
        }

        #[test]
        fn non_text_input_is_a_hard_failure() {
            assert!(matches!(
                parse_document("* H\n\0binary"),
                Err(ParseError::NotText)
            ));
        }

        #[test]
        fn preamble_is_kept_verbatim() {
            let input = "#+title: Notes\n\nIntro paragraph.\n* First\n";
            let doc = parse_document(input).unwrap();
            assert_eq!(doc.preamble, "#+title: Notes\n\nIntro paragraph.\n");
            assert_eq!(doc.settings.meta.get("title").map(String::as_str), Some("Notes"));
        }
    }
}

pub mod format {
    //! Serializer: turns a document value back into Org text.
    //!
    //! Verbatim `Text` nodes and the stored raw description keep untouched
    //! regions byte-identical; structured nodes (timestamps, tables, lists)
    //! render canonically. The content edit engine reuses these renderers to
    //! resync raw text after each mutation.

    use crate::core::*;

    pub fn serialize_document(doc: &Document) -> String {
        let mut out = String::new();
        out.push_str(&doc.preamble);
        for header in &doc.headers {
            render_header(&mut out, header);
        }
        out
    }

    fn render_header(out: &mut String, header: &Header) {
        out.push_str(&render_headline(header));
        if !header.planning_items.is_empty() {
            out.push_str(&render_planning(&header.planning_items));
        }
        if !header.property_list_items.is_empty() {
            out.push_str(&render_properties(&header.property_list_items));
        }
        if !header.log_book_entries.is_empty() {
            out.push_str(&render_logbook(&header.log_book_entries));
        }
        out.push_str(&header.raw_description);
    }

    pub fn render_headline(header: &Header) -> String {
        let mut buf = String::new();
        buf.push_str(&"*".repeat(header.nesting_level));
        buf.push(' ');
        if let Some(keyword) = &header.title.todo_keyword {
            buf.push_str(keyword);
            buf.push(' ');
        }
        if let Some(priority) = header.title.priority {
            buf.push_str("[#");
            buf.push(priority);
            buf.push_str("] ");
        }
        buf.push_str(&header.title.raw_title);
        if !header.title.tags.is_empty() {
            if !buf.ends_with(' ') {
                buf.push(' ');
            }
            buf.push(':');
            for tag in &header.title.tags {
                buf.push_str(tag);
                buf.push(':');
            }
        }
        buf.push('\n');
        buf
    }

    fn render_planning(items: &[PlanningItem]) -> String {
        let parts: Vec<String> = items
            .iter()
            .map(|item| format!("{}: {}", item.kind.label(), render_timestamp(&item.timestamp)))
            .collect();
        let mut line = parts.join(" ");
        line.push('\n');
        line
    }

    fn render_properties(items: &[PropertyListItem]) -> String {
        let mut buf = String::new();
        buf.push_str(":PROPERTIES:\n");
        for item in items {
            buf.push(':');
            buf.push_str(&item.property);
            buf.push(':');
            if let Some(value) = &item.value {
                buf.push(' ');
                buf.push_str(value);
            }
            buf.push('\n');
        }
        buf.push_str(":END:\n");
        buf
    }

    fn render_logbook(entries: &[LogBookEntry]) -> String {
        let mut buf = String::new();
        buf.push_str(":LOGBOOK:\n");
        for entry in entries {
            buf.push_str("CLOCK: ");
            buf.push_str(&render_timestamp(&entry.start));
            if let Some(end) = &entry.end {
                buf.push_str("--");
                buf.push_str(&render_timestamp(end));
                let minutes = (end.first.datetime() - entry.start.first.datetime()).num_minutes();
                if minutes >= 0 {
                    buf.push_str(&format!(" => {}:{:02}", minutes / 60, minutes % 60));
                }
            }
            buf.push('\n');
        }
        buf.push_str(":END:\n");
        buf
    }

    /// Render content nodes back to text. Works for title content and for
    /// descriptions; `Text` nodes are emitted verbatim.
    pub fn render_description(nodes: &[ContentNode]) -> String {
        let mut buf = String::new();
        for node in nodes {
            render_node(&mut buf, node);
        }
        buf
    }

    fn render_node(buf: &mut String, node: &ContentNode) {
        match node {
            ContentNode::Text { raw } => buf.push_str(raw),
            ContentNode::Timestamp(ts) => buf.push_str(&render_timestamp(ts)),
            ContentNode::Table(table) => {
                for row in &table.rows {
                    buf.push_str("| ");
                    let cells: Vec<&str> =
                        row.cells.iter().map(|c| c.raw_contents.as_str()).collect();
                    buf.push_str(&cells.join(" | "));
                    buf.push_str(" |\n");
                }
            }
            ContentNode::List(list) => {
                for item in &list.items {
                    buf.push_str(&item.indent);
                    buf.push_str(&item.bullet);
                    buf.push(' ');
                    if let Some(state) = item.checkbox {
                        buf.push_str(match state {
                            CheckboxState::Checked => "[X] ",
                            CheckboxState::Unchecked => "[ ] ",
                        });
                    }
                    buf.push_str(&item.raw_contents);
                    buf.push('\n');
                }
            }
        }
    }

    pub fn render_timestamp(ts: &Timestamp) -> String {
        let mut buf = render_part(&ts.first, ts.active);
        if let Some(second) = &ts.second {
            buf.push_str("--");
            buf.push_str(&render_part(second, ts.active));
        }
        buf
    }

    fn render_part(part: &TimestampPart, active: bool) -> String {
        let mut buf = String::new();
        buf.push(if active { '<' } else { '[' });
        buf.push_str(&part.date.format("%Y-%m-%d %a").to_string());
        if let Some(time) = part.time {
            buf.push(' ');
            buf.push_str(&time.format("%H:%M").to_string());
            if let Some(end) = part.end_time {
                buf.push('-');
                buf.push_str(&end.format("%H:%M").to_string());
            }
        }
        if let Some(Repeater { kind, interval }) = &part.repeater {
            buf.push(' ');
            buf.push_str(match kind {
                RepeaterKind::FromLast => "+",
                RepeaterKind::FromBase => "++",
                RepeaterKind::FromNow => ".+",
            });
            buf.push_str(&render_offset(interval));
        }
        if let Some(Delay { kind, offset }) = &part.delay {
            buf.push(' ');
            buf.push_str(match kind {
                DelayKind::All => "-",
                DelayKind::First => "--",
            });
            buf.push_str(&render_offset(offset));
        }
        buf.push(if active { '>' } else { ']' });
        buf
    }

    fn render_offset(offset: &DateOffset) -> String {
        format!("{}{}", offset.value, offset.unit.suffix())
    }

}

pub mod index {
    //! Lookup layer: maps ids to positions so id-addressed operations avoid
    //! full-tree rescans. The index is rebuilt from a document value whenever
    //! one is needed; the document itself stays plain data.

    use crate::core::*;
    use std::collections::HashMap;

    /// Where a timestamp id resolves to. For timestamps nested inside table
    /// cells or list items, `Description` points at the containing top-level
    /// node and the edit engine recurses from there.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum TimestampLocation {
        Title { header: usize, node: usize },
        Description { header: usize, node: usize },
        Planning { header: usize, item: usize },
        LogStart { header: usize, entry: usize },
        LogEnd { header: usize, entry: usize },
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CellLocation {
        pub header: usize,
        pub node: usize,
        pub row: usize,
        pub column: usize,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ListItemLocation {
        pub header: usize,
        pub node: usize,
        pub item: usize,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PropertyLocation {
        pub header: usize,
        pub item: usize,
    }

    #[derive(Debug, Default)]
    pub struct DocumentIndex {
        headers: HashMap<HeaderId, usize>,
        timestamps: HashMap<TimestampId, TimestampLocation>,
        cells: HashMap<TableCellId, CellLocation>,
        list_items: HashMap<ListItemId, ListItemLocation>,
        properties: HashMap<PropertyListItemId, PropertyLocation>,
    }

    impl DocumentIndex {
        pub fn build(doc: &Document) -> Self {
            let mut index = Self::default();
            for (h, header) in doc.headers.iter().enumerate() {
                index.headers.insert(header.id, h);
                for (n, node) in header.title.title.iter().enumerate() {
                    if let ContentNode::Timestamp(ts) = node {
                        index
                            .timestamps
                            .insert(ts.id, TimestampLocation::Title { header: h, node: n });
                    }
                }
                for (n, node) in header.description.iter().enumerate() {
                    index.index_description_node(h, n, node);
                }
                for (i, item) in header.planning_items.iter().enumerate() {
                    index.timestamps.insert(
                        item.timestamp.id,
                        TimestampLocation::Planning { header: h, item: i },
                    );
                }
                for (e, entry) in header.log_book_entries.iter().enumerate() {
                    index.timestamps.insert(
                        entry.start.id,
                        TimestampLocation::LogStart { header: h, entry: e },
                    );
                    if let Some(end) = &entry.end {
                        index
                            .timestamps
                            .insert(end.id, TimestampLocation::LogEnd { header: h, entry: e });
                    }
                }
                for (i, item) in header.property_list_items.iter().enumerate() {
                    index
                        .properties
                        .insert(item.id, PropertyLocation { header: h, item: i });
                }
            }
            index
        }

        fn index_description_node(&mut self, header: usize, node: usize, content: &ContentNode) {
            match content {
                ContentNode::Timestamp(ts) => {
                    self.timestamps
                        .insert(ts.id, TimestampLocation::Description { header, node });
                }
                ContentNode::Table(table) => {
                    for (r, row) in table.rows.iter().enumerate() {
                        for (c, cell) in row.cells.iter().enumerate() {
                            self.cells.insert(
                                cell.id,
                                CellLocation {
                                    header,
                                    node,
                                    row: r,
                                    column: c,
                                },
                            );
                            for inner in &cell.contents {
                                if let ContentNode::Timestamp(ts) = inner {
                                    self.timestamps.insert(
                                        ts.id,
                                        TimestampLocation::Description { header, node },
                                    );
                                }
                            }
                        }
                    }
                }
                ContentNode::List(list) => {
                    for (i, item) in list.items.iter().enumerate() {
                        self.list_items.insert(
                            item.id,
                            ListItemLocation {
                                header,
                                node,
                                item: i,
                            },
                        );
                        for inner in &item.contents {
                            if let ContentNode::Timestamp(ts) = inner {
                                self.timestamps
                                    .insert(ts.id, TimestampLocation::Description { header, node });
                            }
                        }
                    }
                }
                ContentNode::Text { .. } => {}
            }
        }

        pub fn header_index(&self, id: HeaderId) -> Option<usize> {
            self.headers.get(&id).copied()
        }

        pub fn timestamp(&self, id: TimestampId) -> Option<TimestampLocation> {
            self.timestamps.get(&id).copied()
        }

        pub fn cell(&self, id: TableCellId) -> Option<CellLocation> {
            self.cells.get(&id).copied()
        }

        pub fn list_item(&self, id: ListItemId) -> Option<ListItemLocation> {
            self.list_items.get(&id).copied()
        }

        pub fn property(&self, id: PropertyListItemId) -> Option<PropertyLocation> {
            self.properties.get(&id).copied()
        }
    }

}

pub mod edits {
    //! The edit engines. Every operation is a pure function from a document
    //! value (plus a request) to a new document value, or a typed no-op
    //! reason; unrelated state is never touched.

    pub mod structural {
        //! Operations over the flattened header sequence. All subtree
        //! boundaries come from `Document::subtree_span`.

        use crate::core::*;
        use crate::index::DocumentIndex;
        use crate::parser;

        /// Move the subtree rooted at `source` to become the trailing child
        /// of `target`. Every moved header shifts by the same level delta,
        /// preserving relative nesting inside the subtree.
        pub fn refile_subtree(
            doc: &Document,
            source: HeaderId,
            target: HeaderId,
        ) -> Result<Document, EditError> {
            let index = DocumentIndex::build(doc);
            let source_pos = index.header_index(source).ok_or(EditError::NotFound)?;
            let target_pos = index.header_index(target).ok_or(EditError::NotFound)?;
            let span = doc.subtree_span(source_pos);
            if span.contains(&target_pos) {
                return Err(EditError::InvalidTransition(
                    "refile target lies inside the subtree being moved",
                ));
            }

            let mut doc = doc.clone();
            let source_level = doc.headers[source_pos].nesting_level as isize;
            let target_level = doc.headers[target_pos].nesting_level as isize;
            let moved: Vec<Header> = doc.headers.drain(span.clone()).collect();
            let delta = target_level + 1 - source_level;
            let target_pos = if target_pos > span.start {
                target_pos - moved.len()
            } else {
                target_pos
            };
            let insert_at = doc.subtree_span(target_pos).end;
            let moved = moved.into_iter().map(|mut header| {
                header.nesting_level = (header.nesting_level as isize + delta) as usize;
                header
            });
            doc.headers.splice(insert_at..insert_at, moved);
            Ok(doc)
        }

        /// Change one header's nesting level by -1. Descendants are left
        /// untouched even though the derived tree can become transiently
        /// ambiguous; promoting the whole subtree is `move_subtree_left`.
        pub fn move_header_left(doc: &Document, header: HeaderId) -> Result<Document, EditError> {
            let index = DocumentIndex::build(doc);
            let pos = index.header_index(header).ok_or(EditError::NotFound)?;
            if doc.headers[pos].nesting_level <= 1 {
                return Err(EditError::InvalidTransition(
                    "header is already at the top level",
                ));
            }
            let mut doc = doc.clone();
            doc.headers[pos].nesting_level -= 1;
            Ok(doc)
        }

        pub fn move_header_right(doc: &Document, header: HeaderId) -> Result<Document, EditError> {
            let index = DocumentIndex::build(doc);
            let pos = index.header_index(header).ok_or(EditError::NotFound)?;
            let mut doc = doc.clone();
            doc.headers[pos].nesting_level += 1;
            Ok(doc)
        }

        pub fn move_subtree_left(doc: &Document, header: HeaderId) -> Result<Document, EditError> {
            let index = DocumentIndex::build(doc);
            let pos = index.header_index(header).ok_or(EditError::NotFound)?;
            if doc.headers[pos].nesting_level <= 1 {
                return Err(EditError::InvalidTransition(
                    "header is already at the top level",
                ));
            }
            let mut doc = doc.clone();
            let span = doc.subtree_span(pos);
            for header in &mut doc.headers[span] {
                header.nesting_level -= 1;
            }
            Ok(doc)
        }

        pub fn move_subtree_right(doc: &Document, header: HeaderId) -> Result<Document, EditError> {
            let index = DocumentIndex::build(doc);
            let pos = index.header_index(header).ok_or(EditError::NotFound)?;
            let mut doc = doc.clone();
            let span = doc.subtree_span(pos);
            for header in &mut doc.headers[span] {
                header.nesting_level += 1;
            }
            Ok(doc)
        }

        /// Parse rendered capture content as standalone headers (fresh ids)
        /// and splice them at the very start or end of the sequence.
        pub fn insert_capture(
            doc: &Document,
            content: &str,
            prepend: bool,
        ) -> Result<Document, EditError> {
            let parsed = parser::parse_with_settings(content, &doc.settings)
                .map_err(|_| EditError::InvalidTransition("capture content is not parseable"))?;
            if parsed.headers.is_empty() {
                return Err(EditError::InvalidTransition(
                    "capture content contains no header",
                ));
            }
            let mut doc = doc.clone();
            if prepend {
                doc.headers.splice(0..0, parsed.headers);
            } else {
                doc.headers.extend(parsed.headers);
            }
            Ok(doc)
        }

        /// Insert an empty header after the given position, at that
        /// position's nesting level.
        pub fn add_header(doc: &Document, after_index: usize) -> Result<Document, EditError> {
            if after_index >= doc.headers.len() {
                return Err(EditError::NotFound);
            }
            let mut doc = doc.clone();
            let level = doc.headers[after_index].nesting_level;
            doc.headers.insert(after_index + 1, Header::new(level));
            Ok(doc)
        }

        /// Remove a header together with its subtree.
        pub fn remove_header(doc: &Document, header: HeaderId) -> Result<Document, EditError> {
            let index = DocumentIndex::build(doc);
            let pos = index.header_index(header).ok_or(EditError::NotFound)?;
            let mut doc = doc.clone();
            let span = doc.subtree_span(pos);
            doc.headers.drain(span);
            Ok(doc)
        }

    }

    pub mod content {
        //! Id-addressed in-place updates of header content. Each operation
        //! resyncs the owning header's raw text through the shared renderers.

        use crate::core::*;
        use crate::format;
        use crate::index::{CellLocation, DocumentIndex, TimestampLocation};
        use chrono::{Duration, Months, NaiveDateTime};

        /// Cycle a header's todo keyword through its keyword set. Completing
        /// a header whose planning timestamps repeat does not settle in the
        /// done state: the repeating timestamps advance, the completion is
        /// logged, and the keyword resets to the set's first active keyword.
        pub fn advance_todo_state(
            doc: &Document,
            header_id: HeaderId,
            logging_disabled: bool,
            now: NaiveDateTime,
        ) -> Result<Document, EditError> {
            let index = DocumentIndex::build(doc);
            let pos = index.header_index(header_id).ok_or(EditError::NotFound)?;
            let mut doc = doc.clone();
            let set = doc
                .settings
                .set_for(doc.headers[pos].title.todo_keyword.as_deref())
                .clone();
            let header = &mut doc.headers[pos];
            let next = set.next_keyword(header.title.todo_keyword.as_deref());
            let completes = next
                .as_deref()
                .map(|keyword| set.is_done(keyword))
                .unwrap_or(false);
            let repeats = header
                .planning_items
                .iter()
                .any(|item| item.timestamp.first.repeater.is_some());

            if completes && repeats {
                let mut previous: Option<TimestampPart> = None;
                for item in &mut header.planning_items {
                    if let Some(repeater) = item.timestamp.first.repeater {
                        if previous.is_none() {
                            previous = Some(item.timestamp.first.clone());
                        }
                        item.timestamp.first =
                            advance_repeating_part(&item.timestamp.first, &repeater, now);
                    }
                }
                if !logging_disabled {
                    let completion = Timestamp::at(now.date(), now.time(), false);
                    let mut start_part = previous.expect("a repeating planning item exists");
                    start_part.repeater = None;
                    start_part.delay = None;
                    header.log_book_entries.push(LogBookEntry {
                        id: LogEntryId::new(),
                        start: Timestamp::from_part(false, start_part),
                        end: Some(completion.clone()),
                    });
                    set_property(header, "LAST_REPEAT", format::render_timestamp(&completion));
                }
                header.title.todo_keyword = set.first_active().map(str::to_string);
            } else {
                header.title.todo_keyword = next;
            }
            Ok(doc)
        }

        fn advance_repeating_part(
            part: &TimestampPart,
            repeater: &Repeater,
            now: NaiveDateTime,
        ) -> TimestampPart {
            let mut out = part.clone();
            match repeater.kind {
                RepeaterKind::FromLast => shift_part(&mut out, &repeater.interval),
                RepeaterKind::FromBase => {
                    shift_part(&mut out, &repeater.interval);
                    while out.datetime() <= now {
                        shift_part(&mut out, &repeater.interval);
                    }
                }
                RepeaterKind::FromNow => {
                    out.date = now.date();
                    shift_part(&mut out, &repeater.interval);
                }
            }
            out
        }

        fn shift_part(part: &mut TimestampPart, interval: &DateOffset) {
            let value = interval.value as i64;
            match interval.unit {
                OffsetUnit::Hour => {
                    let shifted = part.datetime() + Duration::hours(value);
                    part.date = shifted.date();
                    part.time = Some(shifted.time());
                    if let Some(end) = part.end_time {
                        part.end_time = Some(end + Duration::hours(value));
                    }
                }
                OffsetUnit::Day => part.date = part.date + Duration::days(value),
                OffsetUnit::Week => part.date = part.date + Duration::days(7 * value),
                OffsetUnit::Month => {
                    part.date = part
                        .date
                        .checked_add_months(Months::new(interval.value))
                        .unwrap_or(part.date);
                }
                OffsetUnit::Year => {
                    part.date = part
                        .date
                        .checked_add_months(Months::new(interval.value * 12))
                        .unwrap_or(part.date);
                }
            }
        }

        fn set_property(header: &mut Header, property: &str, value: String) {
            if let Some(item) = header
                .property_list_items
                .iter_mut()
                .find(|item| item.property == property)
            {
                item.value = Some(value);
            } else {
                header
                    .property_list_items
                    .push(PropertyListItem::new(property, Some(value)));
            }
        }

        /// Replace one side of one log-book entry; everything else is kept.
        pub fn update_log_entry_time(
            doc: &Document,
            header_id: HeaderId,
            entry_index: usize,
            field: LogTimeField,
            timestamp: Timestamp,
        ) -> Result<Document, EditError> {
            let index = DocumentIndex::build(doc);
            let pos = index.header_index(header_id).ok_or(EditError::NotFound)?;
            let mut doc = doc.clone();
            let entry = doc.headers[pos]
                .log_book_entries
                .get_mut(entry_index)
                .ok_or(EditError::NotFound)?;
            match field {
                LogTimeField::Start => entry.start = timestamp,
                LogTimeField::End => entry.end = Some(timestamp),
            }
            Ok(doc)
        }

        /// Wholesale replacement of one header's property list.
        pub fn update_property_list_items(
            doc: &Document,
            header_id: HeaderId,
            items: Vec<PropertyListItem>,
        ) -> Result<Document, EditError> {
            let index = DocumentIndex::build(doc);
            let pos = index.header_index(header_id).ok_or(EditError::NotFound)?;
            let mut doc = doc.clone();
            doc.headers[pos].property_list_items = items;
            Ok(doc)
        }

        /// Insert a planning item, keeping SCHEDULED before DEADLINE before
        /// CLOSED; a second item of the same kind is rejected.
        pub fn add_new_planning_item(
            doc: &Document,
            header_id: HeaderId,
            kind: PlanningKind,
            timestamp: Timestamp,
        ) -> Result<Document, EditError> {
            let index = DocumentIndex::build(doc);
            let pos = index.header_index(header_id).ok_or(EditError::NotFound)?;
            let mut doc = doc.clone();
            let items = &mut doc.headers[pos].planning_items;
            if items.iter().any(|item| item.kind == kind) {
                return Err(EditError::InvalidTransition(
                    "planning item of this kind already exists",
                ));
            }
            let insert_at = items
                .iter()
                .position(|item| item.kind.rank() > kind.rank())
                .unwrap_or(items.len());
            items.insert(insert_at, PlanningItem::new(kind, timestamp));
            Ok(doc)
        }

        pub fn update_planning_item_timestamp(
            doc: &Document,
            header_id: HeaderId,
            item_index: usize,
            timestamp: Timestamp,
        ) -> Result<Document, EditError> {
            let index = DocumentIndex::build(doc);
            let pos = index.header_index(header_id).ok_or(EditError::NotFound)?;
            let mut doc = doc.clone();
            let item = doc.headers[pos]
                .planning_items
                .get_mut(item_index)
                .ok_or(EditError::NotFound)?;
            item.timestamp = timestamp;
            Ok(doc)
        }

        /// Replace a timestamp wherever it occurs, keeping its id. Only the
        /// owning region's raw text is resynced; sibling content is kept.
        pub fn update_timestamp_with_id(
            doc: &Document,
            timestamp_id: TimestampId,
            value: Timestamp,
        ) -> Result<Document, EditError> {
            let index = DocumentIndex::build(doc);
            let location = index.timestamp(timestamp_id).ok_or(EditError::NotFound)?;
            let mut doc = doc.clone();
            let mut value = value;
            value.id = timestamp_id;
            match location {
                TimestampLocation::Title { header, node } => {
                    let title = &mut doc.headers[header].title;
                    replace_timestamp_in_nodes(
                        std::slice::from_mut(&mut title.title[node]),
                        timestamp_id,
                        &value,
                    );
                    title.raw_title = format::render_description(&title.title);
                }
                TimestampLocation::Description { header, node } => {
                    let owner = &mut doc.headers[header];
                    replace_timestamp_in_nodes(
                        std::slice::from_mut(&mut owner.description[node]),
                        timestamp_id,
                        &value,
                    );
                    owner.raw_description = format::render_description(&owner.description);
                }
                TimestampLocation::Planning { header, item } => {
                    doc.headers[header].planning_items[item].timestamp = value;
                }
                TimestampLocation::LogStart { header, entry } => {
                    doc.headers[header].log_book_entries[entry].start = value;
                }
                TimestampLocation::LogEnd { header, entry } => {
                    doc.headers[header].log_book_entries[entry].end = Some(value);
                }
            }
            Ok(doc)
        }

        fn replace_timestamp_in_nodes(
            nodes: &mut [ContentNode],
            id: TimestampId,
            value: &Timestamp,
        ) -> bool {
            for node in nodes {
                match node {
                    ContentNode::Timestamp(ts) if ts.id == id => {
                        *ts = value.clone();
                        return true;
                    }
                    ContentNode::Table(table) => {
                        for row in &mut table.rows {
                            for cell in &mut row.cells {
                                if replace_timestamp_in_nodes(&mut cell.contents, id, value) {
                                    cell.raw_contents =
                                        format::render_description(&cell.contents);
                                    return true;
                                }
                            }
                        }
                    }
                    ContentNode::List(list) => {
                        for item in &mut list.items {
                            if replace_timestamp_in_nodes(&mut item.contents, id, value) {
                                item.raw_contents = format::render_description(&item.contents);
                                return true;
                            }
                        }
                    }
                    _ => {}
                }
            }
            false
        }

        /* ----------------------- Tags and property order ----------------------- */

        fn move_element<T>(items: &mut Vec<T>, from: usize, to: usize) -> Result<(), EditError> {
            if from >= items.len() || to >= items.len() {
                return Err(EditError::NotFound);
            }
            let item = items.remove(from);
            items.insert(to, item);
            Ok(())
        }

        pub fn reorder_property_list(
            doc: &Document,
            header_id: HeaderId,
            from_index: usize,
            to_index: usize,
        ) -> Result<Document, EditError> {
            let index = DocumentIndex::build(doc);
            let pos = index.header_index(header_id).ok_or(EditError::NotFound)?;
            let mut doc = doc.clone();
            move_element(&mut doc.headers[pos].property_list_items, from_index, to_index)?;
            Ok(doc)
        }

        /// Reorder the selected header's tags.
        pub fn reorder_tags(
            doc: &Document,
            from_index: usize,
            to_index: usize,
        ) -> Result<Document, EditError> {
            let selected = doc.selected_header_id.ok_or(EditError::NotFound)?;
            let index = DocumentIndex::build(doc);
            let pos = index.header_index(selected).ok_or(EditError::NotFound)?;
            let mut doc = doc.clone();
            move_element(&mut doc.headers[pos].title.tags, from_index, to_index)?;
            Ok(doc)
        }

        pub fn set_header_tags(
            doc: &Document,
            header_id: HeaderId,
            tags: Vec<String>,
        ) -> Result<Document, EditError> {
            let index = DocumentIndex::build(doc);
            let pos = index.header_index(header_id).ok_or(EditError::NotFound)?;
            let mut doc = doc.clone();
            doc.headers[pos].title.tags = tags;
            Ok(doc)
        }

        /* ------------------------------ Checkboxes ------------------------------ */

        /// Toggle one checkbox item; siblings and ancestors are untouched.
        pub fn advance_checkbox_state(
            doc: &Document,
            item_id: ListItemId,
        ) -> Result<Document, EditError> {
            let index = DocumentIndex::build(doc);
            let location = index.list_item(item_id).ok_or(EditError::NotFound)?;
            let mut doc = doc.clone();
            let header = &mut doc.headers[location.header];
            let ContentNode::List(list) = &mut header.description[location.node] else {
                return Err(EditError::NotFound);
            };
            let item = &mut list.items[location.item];
            item.checkbox = match item.checkbox {
                Some(CheckboxState::Checked) => Some(CheckboxState::Unchecked),
                Some(CheckboxState::Unchecked) => Some(CheckboxState::Checked),
                None => {
                    return Err(EditError::InvalidTransition("list item has no checkbox"));
                }
            };
            header.raw_description = format::render_description(&header.description);
            Ok(doc)
        }

        /* -------------------------------- Tables -------------------------------- */

        fn with_selected_table<F>(doc: &Document, edit: F) -> Result<Document, EditError>
        where
            F: FnOnce(&mut Table, CellLocation) -> Result<(), EditError>,
        {
            let cell_id = doc.selected_table_cell_id.ok_or(EditError::NotFound)?;
            let location = DocumentIndex::build(doc)
                .cell(cell_id)
                .ok_or(EditError::NotFound)?;
            let mut doc = doc.clone();
            let header = &mut doc.headers[location.header];
            let ContentNode::Table(table) = &mut header.description[location.node] else {
                return Err(EditError::NotFound);
            };
            edit(table, location)?;
            header.raw_description = format::render_description(&header.description);
            Ok(doc)
        }

        /// Swap the selected column with its left neighbor in every row; the
        /// leftmost column cannot move further left.
        pub fn move_table_column_left(doc: &Document) -> Result<Document, EditError> {
            with_selected_table(doc, |table, location| {
                if location.column == 0 {
                    return Err(EditError::InvalidTransition("column is already leftmost"));
                }
                for row in &mut table.rows {
                    if location.column < row.cells.len() {
                        row.cells.swap(location.column - 1, location.column);
                    }
                }
                Ok(())
            })
        }

        pub fn move_table_column_right(doc: &Document) -> Result<Document, EditError> {
            with_selected_table(doc, |table, location| {
                let width = table
                    .rows
                    .get(location.row)
                    .map(|row| row.cells.len())
                    .unwrap_or(0);
                if location.column + 1 >= width {
                    return Err(EditError::InvalidTransition("column is already rightmost"));
                }
                for row in &mut table.rows {
                    if location.column + 1 < row.cells.len() {
                        row.cells.swap(location.column, location.column + 1);
                    }
                }
                Ok(())
            })
        }

        pub fn move_table_row_up(doc: &Document) -> Result<Document, EditError> {
            with_selected_table(doc, |table, location| {
                if location.row == 0 {
                    return Err(EditError::InvalidTransition("row is already at the top"));
                }
                table.rows.swap(location.row - 1, location.row);
                Ok(())
            })
        }

        pub fn move_table_row_down(doc: &Document) -> Result<Document, EditError> {
            with_selected_table(doc, |table, location| {
                if location.row + 1 >= table.rows.len() {
                    return Err(EditError::InvalidTransition("row is already at the bottom"));
                }
                table.rows.swap(location.row, location.row + 1);
                Ok(())
            })
        }

        pub fn remove_table_column(doc: &Document) -> Result<Document, EditError> {
            with_selected_table(doc, |table, location| {
                for row in &mut table.rows {
                    if location.column < row.cells.len() {
                        row.cells.remove(location.column);
                    }
                }
                Ok(())
            })
        }

        pub fn remove_table_row(doc: &Document) -> Result<Document, EditError> {
            with_selected_table(doc, |table, location| {
                table.rows.remove(location.row);
                Ok(())
            })
        }

        /// Insert an empty cell after the selected column in every row.
        pub fn add_new_table_column(doc: &Document) -> Result<Document, EditError> {
            with_selected_table(doc, |table, location| {
                for row in &mut table.rows {
                    let insert_at = (location.column + 1).min(row.cells.len());
                    row.cells.insert(insert_at, TableCell::empty());
                }
                Ok(())
            })
        }

        /// Insert an empty row below the selected row.
        pub fn add_new_table_row(doc: &Document) -> Result<Document, EditError> {
            with_selected_table(doc, |table, location| {
                let width = table.rows[location.row].cells.len();
                let cells = (0..width).map(|_| TableCell::empty()).collect();
                table.rows.insert(location.row + 1, TableRow { cells });
                Ok(())
            })
        }

        /// Replace one cell's raw contents, regenerating its parsed contents
        /// as a single text node.
        pub fn update_table_cell_value(
            doc: &Document,
            cell_id: TableCellId,
            value: &str,
        ) -> Result<Document, EditError> {
            let index = DocumentIndex::build(doc);
            let location = index.cell(cell_id).ok_or(EditError::NotFound)?;
            let mut doc = doc.clone();
            let header = &mut doc.headers[location.header];
            let ContentNode::Table(table) = &mut header.description[location.node] else {
                return Err(EditError::NotFound);
            };
            let cell = &mut table.rows[location.row].cells[location.column];
            cell.raw_contents = value.to_string();
            cell.contents = if value.is_empty() {
                vec![]
            } else {
                vec![ContentNode::Text {
                    raw: value.to_string(),
                }]
            };
            header.raw_description = format::render_description(&header.description);
            Ok(doc)
        }

        /* ------------------------- Selection pass-through ------------------------- */

        pub fn select_header(doc: &Document, header: Option<HeaderId>) -> Document {
            let mut doc = doc.clone();
            doc.selected_header_id = header;
            doc
        }

        pub fn focus_header(doc: &Document, header: Option<HeaderId>) -> Document {
            let mut doc = doc.clone();
            doc.focused_header_id = header;
            doc
        }

        pub fn set_selected_table_cell(doc: &Document, cell: Option<TableCellId>) -> Document {
            let mut doc = doc.clone();
            doc.selected_table_cell_id = cell;
            doc
        }

        #[cfg(test)]
        mod tests {
            use super::*;
            use crate::parser::parse_document;
            use chrono::{NaiveDate, NaiveTime};

            const TODOS_FIXTURE: &str = "\
* DONE This is done
* TODO Header to advance
* This is not a todo
* TODO Repeating task
SCHEDULED: <2020-04-05 Sun +1w>
";

            fn date(y: i32, m: u32, d: u32) -> NaiveDate {
                NaiveDate::from_ymd_opt(y, m, d).unwrap()
            }

            fn noon(y: i32, m: u32, d: u32) -> NaiveDateTime {
                date(y, m, d).and_hms_opt(12, 0, 0).unwrap()
            }

            #[test]
            fn advancing_changes_only_the_named_header() {
                let doc = parse_document(TODOS_FIXTURE).unwrap();
                let new_doc =
                    advance_todo_state(&doc, doc.headers[1].id, false, noon(2020, 4, 8)).unwrap();
                assert_eq!(
                    new_doc.headers[1].title.todo_keyword.as_deref(),
                    Some("DONE")
                );
                assert_eq!(new_doc.headers[0], doc.headers[0]);
                assert_eq!(new_doc.headers[2], doc.headers[2]);
                assert_eq!(new_doc.headers[3], doc.headers[3]);
            }

            #[test]
            fn done_cycles_to_no_keyword_and_back() {
                let doc = parse_document(TODOS_FIXTURE).unwrap();
                let cleared =
                    advance_todo_state(&doc, doc.headers[0].id, false, noon(2020, 4, 8)).unwrap();
                assert_eq!(cleared.headers[0].title.todo_keyword, None);
                let restarted =
                    advance_todo_state(&cleared, cleared.headers[0].id, false, noon(2020, 4, 8))
                        .unwrap();
                assert_eq!(
                    restarted.headers[0].title.todo_keyword.as_deref(),
                    Some("TODO")
                );
            }

            #[test]
            fn completing_a_repeating_task_advances_instead_of_settling() {
                let doc = parse_document(TODOS_FIXTURE).unwrap();
                let header_id = doc.headers[3].id;
                let now = noon(2020, 4, 8);
                let new_doc = advance_todo_state(&doc, header_id, false, now).unwrap();
                let header = &new_doc.headers[3];

                assert_eq!(header.title.todo_keyword.as_deref(), Some("TODO"));
                assert_eq!(
                    header.planning_items[0].timestamp.first.date,
                    date(2020, 4, 12)
                );
                assert_eq!(header.log_book_entries.len(), 1);
                let entry = &header.log_book_entries[0];
                assert_eq!(entry.start.first.date, date(2020, 4, 5));
                assert!(entry.start.first.repeater.is_none());
                assert_eq!(entry.end.as_ref().unwrap().first.date, date(2020, 4, 8));
                let last_repeat = header.property_list_items.last().unwrap();
                assert_eq!(last_repeat.property, "LAST_REPEAT");
                assert_eq!(
                    last_repeat.value.as_deref(),
                    Some("[2020-04-08 Wed 12:00]")
                );

                // A second completion advances and logs again.
                let again = advance_todo_state(&new_doc, header_id, false, now).unwrap();
                assert_eq!(
                    again.headers[3].planning_items[0].timestamp.first.date,
                    date(2020, 4, 19)
                );
                assert_eq!(again.headers[3].log_book_entries.len(), 2);
            }

            #[test]
            fn logging_can_be_disabled_for_repeaters() {
                let doc = parse_document(TODOS_FIXTURE).unwrap();
                let new_doc =
                    advance_todo_state(&doc, doc.headers[3].id, true, noon(2020, 4, 8)).unwrap();
                let header = &new_doc.headers[3];
                assert!(header.log_book_entries.is_empty());
                assert!(header.property_list_items.is_empty());
                assert_eq!(
                    header.planning_items[0].timestamp.first.date,
                    date(2020, 4, 12)
                );
                assert_eq!(header.title.todo_keyword.as_deref(), Some("TODO"));
            }

            #[test]
            fn catch_up_repeaters_step_past_now() {
                let doc =
                    parse_document("* TODO Weekly\nSCHEDULED: <2020-01-01 Wed ++1w>\n").unwrap();
                let new_doc =
                    advance_todo_state(&doc, doc.headers[0].id, true, noon(2020, 4, 8)).unwrap();
                assert_eq!(
                    new_doc.headers[0].planning_items[0].timestamp.first.date,
                    date(2020, 4, 15)
                );
            }

            #[test]
            fn rebasing_repeaters_shift_from_now() {
                let doc =
                    parse_document("* TODO Watering\nSCHEDULED: <2020-01-01 Wed .+3d>\n").unwrap();
                let new_doc =
                    advance_todo_state(&doc, doc.headers[0].id, true, noon(2020, 4, 8)).unwrap();
                assert_eq!(
                    new_doc.headers[0].planning_items[0].timestamp.first.date,
                    date(2020, 4, 11)
                );
            }

            #[test]
            fn monthly_repeaters_use_calendar_arithmetic() {
                let doc = parse_document("* TODO Rent\nSCHEDULED: <2020-01-31 Fri +1m>\n").unwrap();
                let new_doc =
                    advance_todo_state(&doc, doc.headers[0].id, true, noon(2020, 1, 31)).unwrap();
                assert_eq!(
                    new_doc.headers[0].planning_items[0].timestamp.first.date,
                    date(2020, 2, 29)
                );
            }

            #[test]
            fn custom_sequences_cycle_their_own_keywords() {
                let doc =
                    parse_document("#+TODO: START INPROGRESS | FINISHED\n* START Task\n").unwrap();
                let header_id = doc.headers[0].id;
                let step1 = advance_todo_state(&doc, header_id, false, noon(2020, 4, 8)).unwrap();
                assert_eq!(
                    step1.headers[0].title.todo_keyword.as_deref(),
                    Some("INPROGRESS")
                );
                let step2 = advance_todo_state(&step1, header_id, false, noon(2020, 4, 8)).unwrap();
                assert_eq!(
                    step2.headers[0].title.todo_keyword.as_deref(),
                    Some("FINISHED")
                );
                let step3 = advance_todo_state(&step2, header_id, false, noon(2020, 4, 8)).unwrap();
                assert_eq!(step3.headers[0].title.todo_keyword, None);
            }

            const LOGBOOK_FIXTURE: &str = "\
* Clocked task
:LOGBOOK:
CLOCK: [2020-04-01 Wed 09:00]--[2020-04-01 Wed 10:30] => 1:30
CLOCK: [2020-04-02 Thu 09:00]--[2020-04-02 Thu 09:45] => 0:45
:END:
* Unrelated header
";

            #[test]
            fn update_log_entry_time_touches_one_side_of_one_entry() {
                let doc = parse_document(LOGBOOK_FIXTURE).unwrap();
                let header_id = doc.headers[0].id;
                let ts = Timestamp::at(
                    date(1998, 2, 1),
                    NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
                    true,
                );
                let new_doc =
                    update_log_entry_time(&doc, header_id, 0, LogTimeField::Start, ts.clone())
                        .unwrap();
                let header = &new_doc.headers[0];
                assert_eq!(header.log_book_entries[0].start.first.date, date(1998, 2, 1));
                assert_eq!(
                    header.log_book_entries[0].end,
                    doc.headers[0].log_book_entries[0].end
                );
                assert_eq!(
                    header.log_book_entries[1],
                    doc.headers[0].log_book_entries[1]
                );
                assert_eq!(new_doc.headers[1], doc.headers[1]);
                assert!(matches!(
                    update_log_entry_time(&doc, header_id, 9, LogTimeField::Start, ts),
                    Err(EditError::NotFound)
                ));
            }

            const PROPERTIES_FIXTURE: &str = "\
* Widget
:PROPERTIES:
:foo: 1
:bar: 2
:bay: 3
:baz: 4
:END:
* Unrelated header
";

            #[test]
            fn property_list_replacement_is_scoped_to_one_header() {
                let doc = parse_document(PROPERTIES_FIXTURE).unwrap();
                let header_id = doc.headers[0].id;
                let items = vec![
                    PropertyListItem::new("fst", Some("car".into())),
                    PropertyListItem::new("snd", None),
                ];
                let new_doc = update_property_list_items(&doc, header_id, items.clone()).unwrap();
                assert_eq!(new_doc.headers[0].property_list_items, items);
                assert_eq!(new_doc.headers[1], doc.headers[1]);
            }

            #[test]
            fn property_reorder_is_an_array_move() {
                let doc = parse_document(PROPERTIES_FIXTURE).unwrap();
                let header_id = doc.headers[0].id;
                let new_doc = reorder_property_list(&doc, header_id, 1, 3).unwrap();
                let names: Vec<&str> = new_doc.headers[0]
                    .property_list_items
                    .iter()
                    .map(|p| p.property.as_str())
                    .collect();
                assert_eq!(names, vec!["foo", "bay", "baz", "bar"]);
                assert_eq!(new_doc.headers[1], doc.headers[1]);
                assert!(matches!(
                    reorder_property_list(&doc, header_id, 1, 9),
                    Err(EditError::NotFound)
                ));
            }

            #[test]
            fn planning_items_keep_canonical_order_and_stay_unique() {
                let doc = parse_document("* TODO Errand\nSCHEDULED: <2020-04-05 Sun>\n").unwrap();
                let header_id = doc.headers[0].id;

                let with_deadline = add_new_planning_item(
                    &doc,
                    header_id,
                    PlanningKind::Deadline,
                    Timestamp::on_date(date(2020, 4, 10), true),
                )
                .unwrap();
                let kinds: Vec<PlanningKind> = with_deadline.headers[0]
                    .planning_items
                    .iter()
                    .map(|item| item.kind)
                    .collect();
                assert_eq!(kinds, vec![PlanningKind::Scheduled, PlanningKind::Deadline]);

                let with_closed = add_new_planning_item(
                    &with_deadline,
                    header_id,
                    PlanningKind::Closed,
                    Timestamp::on_date(date(2020, 4, 11), false),
                )
                .unwrap();
                let kinds: Vec<PlanningKind> = with_closed.headers[0]
                    .planning_items
                    .iter()
                    .map(|item| item.kind)
                    .collect();
                assert_eq!(
                    kinds,
                    vec![
                        PlanningKind::Scheduled,
                        PlanningKind::Deadline,
                        PlanningKind::Closed
                    ]
                );

                assert!(matches!(
                    add_new_planning_item(
                        &with_closed,
                        header_id,
                        PlanningKind::Scheduled,
                        Timestamp::on_date(date(2020, 4, 12), true),
                    ),
                    Err(EditError::InvalidTransition(_))
                ));
            }

            #[test]
            fn planning_item_timestamps_update_in_place() {
                let doc = parse_document("* TODO Errand\nSCHEDULED: <2020-04-05 Sun>\n").unwrap();
                let header_id = doc.headers[0].id;
                let new_doc = update_planning_item_timestamp(
                    &doc,
                    header_id,
                    0,
                    Timestamp::on_date(date(1998, 2, 1), true),
                )
                .unwrap();
                let items = &new_doc.headers[0].planning_items;
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].kind, PlanningKind::Scheduled);
                assert_eq!(items[0].timestamp.first.date, date(1998, 2, 1));
                assert_eq!(new_doc.headers[0].title, doc.headers[0].title);
            }

            const TIMESTAMPS_FIXTURE: &str = "\
* Meeting <2020-04-05 Sun 10:00>
SCHEDULED: <2020-04-06 Mon>
Before text
At <2020-04-10 Fri> we meet
";

            #[test]
            fn title_timestamp_updates_touch_title_content_only() {
                let doc = parse_document(TIMESTAMPS_FIXTURE).unwrap();
                let ContentNode::Timestamp(ts) = &doc.headers[0].title.title[1] else {
                    panic!("expected title timestamp");
                };
                let replacement = Timestamp::at(
                    date(1998, 2, 1),
                    NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
                    true,
                );
                let new_doc = update_timestamp_with_id(&doc, ts.id, replacement).unwrap();
                let title = &new_doc.headers[0].title;
                let ContentNode::Timestamp(updated) = &title.title[1] else {
                    panic!("expected updated timestamp");
                };
                assert_eq!(updated.id, ts.id);
                assert_eq!(updated.first.date, date(1998, 2, 1));
                assert_eq!(title.raw_title, "Meeting <1998-02-01 Sun 09:30>");
                assert_eq!(new_doc.headers[0].description, doc.headers[0].description);
                assert_eq!(
                    new_doc.headers[0].raw_description,
                    doc.headers[0].raw_description
                );
                assert_eq!(new_doc.headers.len(), doc.headers.len());
            }

            #[test]
            fn description_timestamp_updates_keep_the_title() {
                let doc = parse_document(TIMESTAMPS_FIXTURE).unwrap();
                let ContentNode::Timestamp(ts) = &doc.headers[0].description[1] else {
                    panic!("expected description timestamp");
                };
                let new_doc = update_timestamp_with_id(
                    &doc,
                    ts.id,
                    Timestamp::on_date(date(1998, 2, 1), true),
                )
                .unwrap();
                assert_eq!(new_doc.headers[0].title, doc.headers[0].title);
                assert_eq!(
                    new_doc.headers[0].raw_description,
                    "Before text\nAt <1998-02-01 Sun> we meet\n"
                );
                assert!(matches!(
                    update_timestamp_with_id(
                        &doc,
                        TimestampId::new(),
                        Timestamp::on_date(date(1998, 2, 1), true)
                    ),
                    Err(EditError::NotFound)
                ));
            }

            #[test]
            fn timestamps_inside_table_cells_update_through_the_index() {
                let doc = parse_document("* T\n| due <2020-04-05 Sun> | other |\n").unwrap();
                let ContentNode::Table(old_table) = doc.headers[0].description[0].clone() else {
                    panic!("expected table");
                };
                let ContentNode::Timestamp(ts) = &old_table.rows[0].cells[0].contents[1] else {
                    panic!("expected cell timestamp");
                };
                let new_doc = update_timestamp_with_id(
                    &doc,
                    ts.id,
                    Timestamp::on_date(date(2021, 1, 3), true),
                )
                .unwrap();
                let ContentNode::Table(table) = &new_doc.headers[0].description[0] else {
                    panic!("expected table");
                };
                assert_eq!(table.rows[0].cells[0].raw_contents, "due <2021-01-03 Sun>");
                assert_eq!(table.rows[0].cells[1], old_table.rows[0].cells[1]);
            }

            #[test]
            fn reorder_tags_moves_within_the_selected_header() {
                let doc = parse_document("* Header :t1:t2:t3:side_tag:\n* Other\n").unwrap();
                assert!(matches!(reorder_tags(&doc, 0, 2), Err(EditError::NotFound)));
                let selected = select_header(&doc, Some(doc.headers[0].id));
                let new_doc = reorder_tags(&selected, 0, 2).unwrap();
                assert_eq!(
                    new_doc.headers[0].title.tags,
                    vec!["t2", "t3", "t1", "side_tag"]
                );
                assert_eq!(
                    new_doc.headers[0].title.raw_title,
                    selected.headers[0].title.raw_title
                );
                assert_eq!(new_doc.headers[1], selected.headers[1]);
            }

            #[test]
            fn set_header_tags_replaces_the_sequence() {
                let doc = parse_document("* Header :old:\n* Other\n").unwrap();
                let new_doc = set_header_tags(
                    &doc,
                    doc.headers[0].id,
                    vec!["ta".into(), "t1".into(), "side_tag".into()],
                )
                .unwrap();
                assert_eq!(new_doc.headers[0].title.tags, vec!["ta", "t1", "side_tag"]);
                assert_eq!(new_doc.headers[1], doc.headers[1]);
            }

            const CHECKBOX_FIXTURE: &str = "\
* Shopping list
- [ ] uno
- [ ] dos
- [X] tres
* Unrelated header
";

            #[test]
            fn toggling_checks_a_single_box() {
                let doc = parse_document(CHECKBOX_FIXTURE).unwrap();
                let ContentNode::List(list) = doc.headers[0].description[0].clone() else {
                    panic!("expected list");
                };
                let new_doc = advance_checkbox_state(&doc, list.items[1].id).unwrap();
                let ContentNode::List(new_list) = &new_doc.headers[0].description[0] else {
                    panic!("expected list");
                };
                let states: Vec<Option<CheckboxState>> =
                    new_list.items.iter().map(|item| item.checkbox).collect();
                assert_eq!(
                    states,
                    vec![
                        Some(CheckboxState::Unchecked),
                        Some(CheckboxState::Checked),
                        Some(CheckboxState::Checked)
                    ]
                );
                assert_eq!(new_list.items[0], list.items[0]);
                assert_eq!(new_doc.headers[1], doc.headers[1]);
                assert_eq!(
                    new_doc.headers[0].raw_description,
                    "- [ ] uno\n- [X] dos\n- [X] tres\n"
                );
            }

            #[test]
            fn toggling_unchecks_a_checked_box() {
                let doc = parse_document(CHECKBOX_FIXTURE).unwrap();
                let ContentNode::List(list) = doc.headers[0].description[0].clone() else {
                    panic!("expected list");
                };
                let new_doc = advance_checkbox_state(&doc, list.items[2].id).unwrap();
                let ContentNode::List(new_list) = &new_doc.headers[0].description[0] else {
                    panic!("expected list");
                };
                assert_eq!(new_list.items[2].checkbox, Some(CheckboxState::Unchecked));
                assert_eq!(new_list.items[1], list.items[1]);
            }

            const TABLE_FIXTURE: &str = "\
* Table header
| one | two | three |
| uno | dos | tres |
| eins | zwei | drei |
";

            fn table_of(doc: &Document) -> &Table {
                let ContentNode::Table(table) = &doc.headers[0].description[0] else {
                    panic!("expected table");
                };
                table
            }

            fn with_middle_cell_selected(doc: &Document) -> Document {
                let cell = table_of(doc).rows[1].cells[1].id;
                set_selected_table_cell(doc, Some(cell))
            }

            #[test]
            fn column_moves_swap_whole_cells() {
                let doc = with_middle_cell_selected(&parse_document(TABLE_FIXTURE).unwrap());
                let old = table_of(&doc).clone();

                let right = move_table_column_right(&doc).unwrap();
                for (i, row) in table_of(&right).rows.iter().enumerate() {
                    assert_eq!(row.cells[1], old.rows[i].cells[2]);
                    assert_eq!(row.cells[2], old.rows[i].cells[1]);
                    assert_eq!(row.cells[0], old.rows[i].cells[0]);
                    assert_eq!(row.cells.len(), old.rows[i].cells.len());
                }

                let left = move_table_column_left(&doc).unwrap();
                for (i, row) in table_of(&left).rows.iter().enumerate() {
                    assert_eq!(row.cells[0], old.rows[i].cells[1]);
                    assert_eq!(row.cells[1], old.rows[i].cells[0]);
                    assert_eq!(row.cells[2], old.rows[i].cells[2]);
                }
            }

            #[test]
            fn column_moves_stop_at_the_edges() {
                let doc = parse_document(TABLE_FIXTURE).unwrap();
                assert!(matches!(
                    move_table_column_left(&doc),
                    Err(EditError::NotFound)
                ));
                let first =
                    set_selected_table_cell(&doc, Some(table_of(&doc).rows[0].cells[0].id));
                assert!(matches!(
                    move_table_column_left(&first),
                    Err(EditError::InvalidTransition(_))
                ));
                let last = set_selected_table_cell(&doc, Some(table_of(&doc).rows[0].cells[2].id));
                assert!(matches!(
                    move_table_column_right(&last),
                    Err(EditError::InvalidTransition(_))
                ));
            }

            #[test]
            fn row_moves_swap_adjacent_rows() {
                let doc = with_middle_cell_selected(&parse_document(TABLE_FIXTURE).unwrap());
                let old = table_of(&doc).clone();

                let up = move_table_row_up(&doc).unwrap();
                assert_eq!(table_of(&up).rows[0], old.rows[1]);
                assert_eq!(table_of(&up).rows[1], old.rows[0]);
                assert_eq!(table_of(&up).rows[2], old.rows[2]);

                let down = move_table_row_down(&doc).unwrap();
                assert_eq!(table_of(&down).rows[1], old.rows[2]);
                assert_eq!(table_of(&down).rows[2], old.rows[1]);
                assert_eq!(table_of(&down).rows[0], old.rows[0]);
            }

            #[test]
            fn remove_operations_shift_later_cells_up() {
                let doc = with_middle_cell_selected(&parse_document(TABLE_FIXTURE).unwrap());
                let old = table_of(&doc).clone();

                let narrower = remove_table_column(&doc).unwrap();
                for (i, row) in table_of(&narrower).rows.iter().enumerate() {
                    assert_eq!(row.cells.len(), 2);
                    assert_eq!(row.cells[0], old.rows[i].cells[0]);
                    assert_eq!(row.cells[1], old.rows[i].cells[2]);
                }

                let shorter = remove_table_row(&doc).unwrap();
                assert_eq!(table_of(&shorter).rows.len(), 2);
                assert_eq!(table_of(&shorter).rows[0], old.rows[0]);
                assert_eq!(table_of(&shorter).rows[1], old.rows[2]);
            }

            #[test]
            fn add_operations_insert_after_the_selection() {
                let doc = with_middle_cell_selected(&parse_document(TABLE_FIXTURE).unwrap());
                let old = table_of(&doc).clone();

                let wider = add_new_table_column(&doc).unwrap();
                for (i, row) in table_of(&wider).rows.iter().enumerate() {
                    assert_eq!(row.cells.len(), 4);
                    assert_eq!(row.cells[0], old.rows[i].cells[0]);
                    assert_eq!(row.cells[1], old.rows[i].cells[1]);
                    assert_eq!(row.cells[2].raw_contents, "");
                    assert_eq!(row.cells[3], old.rows[i].cells[2]);
                }

                let taller = add_new_table_row(&doc).unwrap();
                assert_eq!(table_of(&taller).rows.len(), 4);
                assert_eq!(table_of(&taller).rows[0], old.rows[0]);
                assert_eq!(table_of(&taller).rows[1], old.rows[1]);
                assert!(
                    table_of(&taller).rows[2]
                        .cells
                        .iter()
                        .all(|cell| cell.raw_contents.is_empty())
                );
                assert_eq!(table_of(&taller).rows[3], old.rows[2]);
            }

            #[test]
            fn cell_value_updates_are_cell_local() {
                let doc = parse_document(TABLE_FIXTURE).unwrap();
                let old = table_of(&doc).clone();
                let cell = old.rows[1].cells[1].id;
                let new_doc = update_table_cell_value(&doc, cell, "Murakami").unwrap();
                let table = table_of(&new_doc);
                assert_eq!(table.rows[1].cells[1].raw_contents, "Murakami");
                assert_eq!(
                    table.rows[1].cells[1].contents,
                    vec![ContentNode::Text {
                        raw: "Murakami".into()
                    }]
                );
                assert_eq!(table.rows[0], old.rows[0]);
                assert_eq!(table.rows[2], old.rows[2]);
                assert_eq!(table.rows[1].cells[0], old.rows[1].cells[0]);
                assert_eq!(table.rows[1].cells[2], old.rows[1].cells[2]);
                assert_eq!(
                    new_doc.headers[0].raw_description,
                    "| one | two | three |\n| uno | Murakami | tres |\n| eins | zwei | drei |\n"
                );
            }
        }
    }
}

pub mod ops {
    //! The request surface: one value per operation named by the edit
    //! engines, dispatched by `apply`. `is_dirtying` is the capability
    //! marker the history coordinator snapshots around; selection and focus
    //! changes are transient.

    use crate::core::*;
    use crate::edits::{content, structural};
    use chrono::NaiveDateTime;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Op {
        RefileSubtree {
            source: HeaderId,
            target: HeaderId,
        },
        MoveHeaderLeft {
            header: HeaderId,
        },
        MoveHeaderRight {
            header: HeaderId,
        },
        MoveSubtreeLeft {
            header: HeaderId,
        },
        MoveSubtreeRight {
            header: HeaderId,
        },
        InsertCapture {
            content: String,
            prepend: bool,
        },
        AddHeader {
            after_index: usize,
        },
        RemoveHeader {
            header: HeaderId,
        },
        AdvanceTodoState {
            header: HeaderId,
            logging_disabled: bool,
            now: NaiveDateTime,
        },
        UpdateLogEntryTime {
            header: HeaderId,
            entry_index: usize,
            field: LogTimeField,
            timestamp: Timestamp,
        },
        UpdatePropertyListItems {
            header: HeaderId,
            items: Vec<PropertyListItem>,
        },
        AddNewPlanningItem {
            header: HeaderId,
            kind: PlanningKind,
            timestamp: Timestamp,
        },
        UpdatePlanningItemTimestamp {
            header: HeaderId,
            item_index: usize,
            timestamp: Timestamp,
        },
        UpdateTimestampWithId {
            timestamp_id: TimestampId,
            value: Timestamp,
        },
        ReorderPropertyList {
            header: HeaderId,
            from_index: usize,
            to_index: usize,
        },
        ReorderTags {
            from_index: usize,
            to_index: usize,
        },
        SetHeaderTags {
            header: HeaderId,
            tags: Vec<String>,
        },
        AdvanceCheckboxState {
            item: ListItemId,
        },
        MoveTableColumnLeft,
        MoveTableColumnRight,
        MoveTableRowUp,
        MoveTableRowDown,
        RemoveTableColumn,
        RemoveTableRow,
        AddNewTableColumn,
        AddNewTableRow,
        UpdateTableCellValue {
            cell: TableCellId,
            value: String,
        },
        SelectHeader {
            header: Option<HeaderId>,
        },
        FocusHeader {
            header: Option<HeaderId>,
        },
        SetSelectedTableCell {
            cell: Option<TableCellId>,
        },
    }

    impl Op {
        /// Dirtying requests are recorded in undo history; transient
        /// selection state changes are not.
        pub fn is_dirtying(&self) -> bool {
            !matches!(
                self,
                Op::SelectHeader { .. } | Op::FocusHeader { .. } | Op::SetSelectedTableCell { .. }
            )
        }
    }

    pub fn apply(doc: &Document, op: &Op) -> Result<Document, EditError> {
        match op {
            Op::RefileSubtree { source, target } => {
                structural::refile_subtree(doc, *source, *target)
            }
            Op::MoveHeaderLeft { header } => structural::move_header_left(doc, *header),
            Op::MoveHeaderRight { header } => structural::move_header_right(doc, *header),
            Op::MoveSubtreeLeft { header } => structural::move_subtree_left(doc, *header),
            Op::MoveSubtreeRight { header } => structural::move_subtree_right(doc, *header),
            Op::InsertCapture { content, prepend } => {
                structural::insert_capture(doc, content, *prepend)
            }
            Op::AddHeader { after_index } => structural::add_header(doc, *after_index),
            Op::RemoveHeader { header } => structural::remove_header(doc, *header),
            Op::AdvanceTodoState {
                header,
                logging_disabled,
                now,
            } => content::advance_todo_state(doc, *header, *logging_disabled, *now),
            Op::UpdateLogEntryTime {
                header,
                entry_index,
                field,
                timestamp,
            } => content::update_log_entry_time(doc, *header, *entry_index, *field, timestamp.clone()),
            Op::UpdatePropertyListItems { header, items } => {
                content::update_property_list_items(doc, *header, items.clone())
            }
            Op::AddNewPlanningItem {
                header,
                kind,
                timestamp,
            } => content::add_new_planning_item(doc, *header, *kind, timestamp.clone()),
            Op::UpdatePlanningItemTimestamp {
                header,
                item_index,
                timestamp,
            } => {
                content::update_planning_item_timestamp(doc, *header, *item_index, timestamp.clone())
            }
            Op::UpdateTimestampWithId {
                timestamp_id,
                value,
            } => content::update_timestamp_with_id(doc, *timestamp_id, value.clone()),
            Op::ReorderPropertyList {
                header,
                from_index,
                to_index,
            } => content::reorder_property_list(doc, *header, *from_index, *to_index),
            Op::ReorderTags {
                from_index,
                to_index,
            } => content::reorder_tags(doc, *from_index, *to_index),
            Op::SetHeaderTags { header, tags } => {
                content::set_header_tags(doc, *header, tags.clone())
            }
            Op::AdvanceCheckboxState { item } => content::advance_checkbox_state(doc, *item),
            Op::MoveTableColumnLeft => content::move_table_column_left(doc),
            Op::MoveTableColumnRight => content::move_table_column_right(doc),
            Op::MoveTableRowUp => content::move_table_row_up(doc),
            Op::MoveTableRowDown => content::move_table_row_down(doc),
            Op::RemoveTableColumn => content::remove_table_column(doc),
            Op::RemoveTableRow => content::remove_table_row(doc),
            Op::AddNewTableColumn => content::add_new_table_column(doc),
            Op::AddNewTableRow => content::add_new_table_row(doc),
            Op::UpdateTableCellValue { cell, value } => {
                content::update_table_cell_value(doc, *cell, value)
            }
            Op::SelectHeader { header } => Ok(content::select_header(doc, *header)),
            Op::FocusHeader { header } => Ok(content::focus_header(doc, *header)),
            Op::SetSelectedTableCell { cell } => {
                Ok(content::set_selected_table_cell(doc, *cell))
            }
        }
    }

}

pub mod history {
    //! Undo/redo over full document snapshots. Exactly one snapshot is
    //! recorded per successfully applied dirtying request; transient
    //! requests and failed requests record nothing.

    use crate::core::{Document, EditError};
    use crate::ops::{self, Op};

    #[derive(Debug, Clone)]
    pub struct Session {
        present: Document,
        past: Vec<Document>,
        future: Vec<Document>,
    }

    impl Session {
        pub fn new(document: Document) -> Self {
            Self {
                present: document,
                past: vec![],
                future: vec![],
            }
        }

        pub fn document(&self) -> &Document {
            &self.present
        }

        /// Apply a request. A failed request leaves both the document and
        /// the history untouched and surfaces the reason to the caller.
        pub fn apply(&mut self, op: &Op) -> Result<(), EditError> {
            let next = ops::apply(&self.present, op)?;
            if op.is_dirtying() {
                self.past.push(std::mem::replace(&mut self.present, next));
                self.future.clear();
            } else {
                self.present = next;
            }
            Ok(())
        }

        pub fn undo(&mut self) -> Result<(), EditError> {
            let previous = self.past.pop().ok_or(EditError::HistoryUnderflow)?;
            self.future
                .push(std::mem::replace(&mut self.present, previous));
            Ok(())
        }

        pub fn redo(&mut self) -> Result<(), EditError> {
            let next = self.future.pop().ok_or(EditError::HistoryUnderflow)?;
            self.past.push(std::mem::replace(&mut self.present, next));
            Ok(())
        }

        pub fn can_undo(&self) -> bool {
            !self.past.is_empty()
        }

        pub fn can_redo(&self) -> bool {
            !self.future.is_empty()
        }
    }

}

pub use format::serialize_document;
pub use parser::parse_document;
