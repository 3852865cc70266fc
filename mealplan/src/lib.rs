//! Meal plan document engine.
//! Reads, edits and reformats weekly meal calendars kept as Markdown notes, in either the
//! outline (list) layout or the grid (table) layout, leaving unrelated text untouched.

pub mod core {
    use chrono::Weekday;
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::fmt;

    /* ------------------------------- Layouts ------------------------------- */

    /// The two textual layouts a meal plan note can use. A document uses exactly one.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Format {
        /// `# Week of <label>` sections with one `## <Day>` block per day.
        List,
        /// A single Markdown table with one row per week.
        Table,
    }

    impl fmt::Display for Format {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Format::List => f.write_str("list"),
                Format::Table => f.write_str("table"),
            }
        }
    }

    /* ----------------------------- Week labels ----------------------------- */

    /// Year-less week identifier such as `January 8th`.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct WeekLabel(pub String);

    impl WeekLabel {
        pub fn new(text: impl Into<String>) -> Self {
            let text = text.into();
            Self(text.trim().to_string())
        }

        pub fn as_str(&self) -> &str {
            &self.0
        }

        pub fn is_empty(&self) -> bool {
            self.0.is_empty()
        }

        /// Month (1..=12) and day of month, if the label is well formed.
        pub fn month_day(&self) -> Option<(u32, u32)> {
            crate::parser::parse_week_label(&self.0)
        }
    }

    impl fmt::Display for WeekLabel {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    /* --------------------------------- Days --------------------------------- */

    /// Day names indexed by the numeric convention 0 = Sunday .. 6 = Saturday.
    pub const DAY_NAMES: [&str; 7] = [
        "Sunday",
        "Monday",
        "Tuesday",
        "Wednesday",
        "Thursday",
        "Friday",
        "Saturday",
    ];

    const WEEKDAYS: [Weekday; 7] = [
        Weekday::Sun,
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
    ];

    pub fn weekday_from_index(index: u8) -> Result<Weekday, DomainError> {
        WEEKDAYS
            .get(index as usize)
            .copied()
            .ok_or(DomainError::InvalidStartOfWeek(index))
    }

    pub fn day_name(day: Weekday) -> &'static str {
        DAY_NAMES[day.num_days_from_sunday() as usize]
    }

    /// Case-insensitive lookup of an English day name ("monday") or its
    /// three-letter abbreviation ("Mon").
    pub fn parse_day_name(name: &str) -> Option<Weekday> {
        let name = name.trim();
        WEEKDAYS.iter().copied().find(|day| {
            let full = day_name(*day);
            full.eq_ignore_ascii_case(name)
                || (name.len() == 3 && full[..3].eq_ignore_ascii_case(name))
        })
    }

    /// The seven days of a week beginning on `start`.
    pub fn day_rotation(start: Weekday) -> [Weekday; 7] {
        let first = start.num_days_from_sunday() as usize;
        std::array::from_fn(|i| WEEKDAYS[(first + i) % 7])
    }

    pub fn day_headers(start: Weekday) -> Vec<String> {
        day_rotation(start)
            .iter()
            .map(|day| day_name(*day).to_string())
            .collect()
    }

    pub(crate) fn same_day(a: &str, b: &str) -> bool {
        a.trim().eq_ignore_ascii_case(b.trim())
    }

    /* -------------------------------- Entries -------------------------------- */

    /// Task-list marker in front of a recipe link (list layout only).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum Checkbox {
        Empty,         // [ ]
        Checked(char), // [x] or [X], kept as written
    }

    impl Checkbox {
        pub fn marker(&self) -> String {
            match self {
                Checkbox::Empty => "[ ]".to_string(),
                Checkbox::Checked(c) => format!("[{c}]"),
            }
        }
    }

    /// Something scheduled on a day: a recipe link or free text.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "kind", rename_all = "snake_case")]
    pub enum Entry {
        Recipe {
            name: String,
            #[serde(default, skip_serializing_if = "Option::is_none")]
            checkbox: Option<Checkbox>,
        },
        Text {
            text: String,
        },
    }

    impl Entry {
        pub fn recipe(name: impl Into<String>) -> Self {
            Entry::Recipe {
                name: name.into().trim().to_string(),
                checkbox: None,
            }
        }

        pub fn text(text: impl Into<String>) -> Self {
            Entry::Text { text: text.into() }
        }

        pub fn recipe_name(&self) -> Option<&str> {
            match self {
                Entry::Recipe { name, .. } => Some(name),
                Entry::Text { .. } => None,
            }
        }

        /// True for a recipe link named `name`; checkboxes and surrounding whitespace are ignored.
        pub fn is_recipe_named(&self, name: &str) -> bool {
            self.recipe_name() == Some(name.trim())
        }

        /// Bullet line for the list layout, without a line ending.
        pub fn render_list_item(&self) -> String {
            match self {
                Entry::Recipe {
                    name,
                    checkbox: Some(checkbox),
                } => format!("- {} [[{}]]", checkbox.marker(), name),
                Entry::Recipe {
                    name,
                    checkbox: None,
                } => format!("- [[{name}]]"),
                Entry::Text { text } => format!("- {text}"),
            }
        }

        /// Fragment for a table cell. Checkboxes have no table representation and are dropped.
        pub fn render_cell(&self) -> String {
            match self {
                Entry::Recipe { name, .. } => escape_pipes(&format!("[[{name}]]")),
                Entry::Text { text } => escape_pipes(text),
            }
        }
    }

    fn escape_pipes(s: &str) -> String {
        let mut out = String::with_capacity(s.len());
        let mut prev = None;
        for c in s.chars() {
            if c == '|' && prev != Some('\\') {
                out.push('\\');
            }
            out.push(c);
            prev = Some(c);
        }
        out
    }

    /* ---------------------------- Source tracking ---------------------------- */

    /// Byte range into the text a document was parsed from.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SourceRange {
        pub start: usize,
        pub end: usize,
    }

    impl SourceRange {
        pub fn new(start: usize, end: usize) -> Self {
            Self { start, end }
        }

        pub fn slice<'a>(&self, source: &'a str) -> &'a str {
            &source[self.start..self.end]
        }

        pub fn is_empty(&self) -> bool {
            self.start >= self.end
        }
    }

    /// An entry plus the text it was parsed from. Entries without a source are rendered.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct EntryWithSource {
        pub entry: Entry,
        pub source: Option<SourceRange>,
    }

    impl EntryWithSource {
        pub fn new(entry: Entry) -> Self {
            Self {
                entry,
                source: None,
            }
        }

        pub fn from_source(entry: Entry, source: SourceRange) -> Self {
            Self {
                entry,
                source: Some(source),
            }
        }
    }

    /// Terminate the current line, if any.
    pub(crate) fn ensure_newline(out: &mut String, newline: &str) {
        if !out.is_empty() && !out.ends_with('\n') {
            out.push_str(newline);
        }
    }

    /// Position `out` at the start of a new block, separated by one blank line.
    pub(crate) fn start_block(out: &mut String, newline: &str) {
        if out.is_empty() {
            return;
        }
        ensure_newline(out, newline);
        if !(out.ends_with("\n\n") || out.ends_with("\n\r\n")) {
            out.push_str(newline);
        }
    }

    /// `"\r\n"` when most lines of `text` end that way, else `"\n"`.
    pub fn dominant_newline(text: &str) -> &'static str {
        let crlf = text.matches("\r\n").count();
        let lf = text.matches('\n').count() - crlf;
        if crlf > lf { "\r\n" } else { "\n" }
    }

    /// Rewrites the `\n` line endings of generated text to `newline`.
    pub(crate) fn with_newline(text: String, newline: &str) -> String {
        if newline == "\n" {
            text
        } else {
            text.replace('\n', newline)
        }
    }

    /* ------------------------------ Week model ------------------------------ */

    /// Layout-independent content of one week.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Week {
        pub label: WeekLabel,
        /// Day header as written -> entries, in document order.
        #[serde(default)]
        pub days: IndexMap<String, Vec<Entry>>,
    }

    impl Week {
        pub fn new(label: WeekLabel) -> Self {
            Self {
                label,
                days: IndexMap::new(),
            }
        }

        pub fn entries_for(&self, day: &str) -> &[Entry] {
            self.days
                .iter()
                .find(|(name, _)| same_day(name, day))
                .map(|(_, entries)| entries.as_slice())
                .unwrap_or(&[])
        }

        pub fn recipe_names(&self) -> impl Iterator<Item = &str> + '_ {
            self.days.values().flatten().filter_map(Entry::recipe_name)
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum DomainError {
        #[error("start of week {0} is out of bounds (0..=6, 0 = Sunday)")]
        InvalidStartOfWeek(u8),
        #[error("unknown day {0:?}")]
        UnknownDay(String),
        #[error("recipe name is empty")]
        EmptyRecipeName,
        #[error("invalid ignore pattern {pattern:?}: {message}")]
        InvalidIgnorePattern { pattern: String, message: String },
    }

}

pub mod week {
    //! Week arithmetic over year-less week labels.
    //!
    //! Days of the week follow the fixed numeric convention (0 = Sunday), never locale names.

    use crate::core::WeekLabel;
    use chrono::{Datelike, Duration, NaiveDate, Weekday};
    use std::cmp::Ordering;

    pub const MONTH_NAMES: [&str; 12] = [
        "January",
        "February",
        "March",
        "April",
        "May",
        "June",
        "July",
        "August",
        "September",
        "October",
        "November",
        "December",
    ];

    /// Years on either side of the reference year tried when resolving a label.
    pub const YEAR_WINDOW: i32 = 1;

    /// First day of the week containing `date`.
    pub fn week_start(date: NaiveDate, start_of_week: Weekday) -> NaiveDate {
        let offset = (date.weekday().num_days_from_sunday() + 7
            - start_of_week.num_days_from_sunday())
            % 7;
        date - Duration::days(i64::from(offset))
    }

    pub fn week_start_label(date: NaiveDate, start_of_week: Weekday) -> WeekLabel {
        format_label(week_start(date, start_of_week))
    }

    /// `January 8th` style label for an absolute date.
    pub fn format_label(date: NaiveDate) -> WeekLabel {
        WeekLabel(format!(
            "{} {}{}",
            MONTH_NAMES[date.month0() as usize],
            date.day(),
            ordinal_suffix(date.day())
        ))
    }

    pub fn ordinal_suffix(day: u32) -> &'static str {
        match (day % 10, day % 100) {
            (_, 11..=13) => "th",
            (1, _) => "st",
            (2, _) => "nd",
            (3, _) => "rd",
            _ => "th",
        }
    }

    /// Absolute date of `label` in the year nearest to `reference` for which the
    /// label falls on a week start. `None` when no year in the window matches.
    pub fn resolve_label_near_date(
        label: &WeekLabel,
        reference: NaiveDate,
        start_of_week: Weekday,
    ) -> Option<NaiveDate> {
        let (month, day) = label.month_day()?;
        (reference.year() - YEAR_WINDOW..=reference.year() + YEAR_WINDOW)
            .filter_map(|year| NaiveDate::from_ymd_opt(year, month, day))
            .filter(|candidate| candidate.weekday() == start_of_week)
            .min_by_key(|candidate| (*candidate - reference).num_days().abs())
    }

    /// [`resolve_label_near_date`], falling back to the label's date in the reference year.
    pub fn resolve_label(
        label: &WeekLabel,
        reference: NaiveDate,
        start_of_week: Weekday,
    ) -> Option<NaiveDate> {
        resolve_label_near_date(label, reference, start_of_week).or_else(|| {
            let (month, day) = label.month_day()?;
            NaiveDate::from_ymd_opt(reference.year(), month, day)
                .or_else(|| NaiveDate::from_ymd_opt(reference.year(), month, day - 1))
        })
    }

    /// Chronological order of two labels, both resolved against `reference`.
    pub fn compare_week_labels(
        a: &WeekLabel,
        b: &WeekLabel,
        reference: NaiveDate,
        start_of_week: Weekday,
    ) -> Option<Ordering> {
        let a = resolve_label(a, reference, start_of_week)?;
        let b = resolve_label(b, reference, start_of_week)?;
        Some(a.cmp(&b))
    }

    /// Index of the first week that resolves to a date after `week_start`.
    /// Labels that cannot be resolved are skipped.
    pub fn first_week_after<'a>(
        labels: impl IntoIterator<Item = (usize, &'a WeekLabel)>,
        week_start: NaiveDate,
        start_of_week: Weekday,
    ) -> Option<usize> {
        labels
            .into_iter()
            .find(|(_, label)| {
                resolve_label(label, week_start, start_of_week).is_some_and(|d| d > week_start)
            })
            .map(|(idx, _)| idx)
    }

}

pub mod parser {
    //! Line grammar shared by both layouts, built on `nom`.
    //!
    //! Every function here takes a single line with its line ending already stripped.

    use crate::core::{Checkbox, Entry};
    use crate::week::MONTH_NAMES;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, tag_no_case, take_until, take_while_m_n},
        character::complete::{alpha1, char, digit1, one_of, space0, space1},
        combinator::{all_consuming, map, map_res, opt, rest, verify},
        error::VerboseError,
        sequence::{delimited, pair, preceded, terminated, tuple},
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /* ------------------------------ Week labels ------------------------------ */

    /// `January 8th` -> `(1, 8)`. The ordinal suffix is optional and case is ignored.
    pub fn parse_week_label(s: &str) -> Option<(u32, u32)> {
        let parsed: PResult<'_, (u32, u32)> = all_consuming(week_label)(s.trim());
        parsed.ok().map(|(_, month_day)| month_day)
    }

    fn week_label(i: &str) -> PResult<'_, (u32, u32)> {
        let (i, month) = map_res(alpha1, month_number)(i)?;
        let (i, _) = space1(i)?;
        let (i, day) = verify(map_res(digit1, |d: &str| d.parse::<u32>()), |d: &u32| {
            (1..=31).contains(d)
        })(i)?;
        let (i, _) = opt(alt((
            tag_no_case("st"),
            tag_no_case("nd"),
            tag_no_case("rd"),
            tag_no_case("th"),
        )))(i)?;
        Ok((i, (month, day)))
    }

    fn month_number(name: &str) -> Result<u32, &'static str> {
        MONTH_NAMES
            .iter()
            .position(|m| m.eq_ignore_ascii_case(name))
            .map(|idx| idx as u32 + 1)
            .ok_or("unknown month")
    }

    /* ------------------------------- Headings ------------------------------- */

    /// Up to three leading spaces, as Markdown allows before a heading.
    fn indent(i: &str) -> PResult<'_, &str> {
        take_while_m_n(0, 3, |c| c == ' ')(i)
    }

    /// `# Week of <label>` -> the label text.
    pub fn week_header(line: &str) -> Option<&str> {
        let parsed: PResult<'_, &str> = preceded(
            tuple((
                indent,
                char('#'),
                space1,
                tag_no_case("week"),
                space1,
                tag_no_case("of"),
                space1,
            )),
            rest,
        )(line);
        match parsed {
            Ok((_, label)) if !label.trim().is_empty() => Some(label.trim()),
            _ => None,
        }
    }

    /// `## <Day>` -> the day text.
    pub fn day_heading(line: &str) -> Option<&str> {
        let parsed: PResult<'_, &str> = preceded(tuple((indent, tag("##"), space1)), rest)(line);
        match parsed {
            Ok((_, day)) if !day.trim().is_empty() => Some(day.trim()),
            _ => None,
        }
    }

    /// Any level-one heading, week header or not.
    pub fn is_top_heading(line: &str) -> bool {
        let parsed: PResult<'_, (&str, char, &str)> = tuple((indent, char('#'), space1))(line);
        parsed.is_ok()
    }

    /* -------------------------------- Entries -------------------------------- */

    /// One non-blank line of a day block. A bullet holding only a link (optionally behind
    /// a checkbox) is a recipe; anything else is plain text without its bullet.
    pub fn list_entry(line: &str) -> Entry {
        let trimmed = line.trim();
        let body = match bullet(trimmed) {
            Ok((rest, _)) => rest,
            Err(_) => trimmed,
        };
        let parsed: PResult<'_, (Option<Checkbox>, &str)> =
            all_consuming(pair(opt(checkbox), terminated(wiki_link, space0)))(body);
        match parsed {
            Ok((_, (checkbox, name))) => Entry::Recipe {
                name: name.trim().to_string(),
                checkbox,
            },
            Err(_) => Entry::text(body),
        }
    }

    fn bullet(i: &str) -> PResult<'_, char> {
        terminated(one_of("-*+"), space1)(i)
    }

    fn checkbox(i: &str) -> PResult<'_, Checkbox> {
        terminated(
            delimited(
                char('['),
                alt((
                    map(char(' '), |_| Checkbox::Empty),
                    map(one_of("xX"), Checkbox::Checked),
                )),
                char(']'),
            ),
            space1,
        )(i)
    }

    fn wiki_link(i: &str) -> PResult<'_, &str> {
        verify(
            delimited(tag("[["), take_until("]]"), tag("]]")),
            |name: &str| !name.trim().is_empty() && !name.contains("[["),
        )(i)
    }

    /// Entries of one table cell: fragments between line-break markers, blanks skipped.
    pub fn cell_entries(cell: &str) -> Vec<Entry> {
        split_line_breaks(cell)
            .into_iter()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                let unescaped = part.replace("\\|", "|");
                let parsed: PResult<'_, &str> = all_consuming(wiki_link)(&unescaped);
                let name = parsed.ok().map(|(_, name)| name.to_string());
                match name {
                    Some(name) => Entry::recipe(name),
                    None => Entry::text(unescaped),
                }
            })
            .collect()
    }

    /// Splits on `<br>`, `<br/>` and `<br />`, ignoring case.
    pub fn split_line_breaks(cell: &str) -> Vec<&str> {
        let lower = cell.to_ascii_lowercase();
        let mut parts = Vec::new();
        let mut start = 0;
        let mut search = 0;
        while let Some(found) = lower[search..].find("<br") {
            let at = search + found;
            let Some(close) = lower[at..].find('>') else {
                break;
            };
            let inner = &lower[at + 3..at + close];
            if inner.trim().trim_end_matches('/').trim().is_empty() {
                parts.push(&cell[start..at]);
                start = at + close + 1;
                search = start;
            } else {
                search = at + 3;
            }
        }
        parts.push(&cell[start..]);
        parts
    }

}

pub mod detect {
    use crate::core::Format;
    use crate::parser;
    use crate::table::{WEEK_START_HEADER, split_row};

    /// Classifies a document as list layout, table layout, or neither.
    ///
    /// A table is recognized by a pipe row whose first cell is `Week Start`; a list by a
    /// `# Week of ` line anywhere in the text. Empty and whitespace-only text is neither.
    pub fn detect_format(content: &str) -> Option<Format> {
        if content.trim().is_empty() {
            return None;
        }
        if content.lines().any(is_table_header) {
            return Some(Format::Table);
        }
        if content
            .lines()
            .any(|line| parser::week_header(line.trim_end_matches('\r')).is_some())
        {
            return Some(Format::List);
        }
        None
    }

    fn is_table_header(line: &str) -> bool {
        split_row(line).is_some_and(|cells| {
            cells
                .first()
                .is_some_and(|first| first.trim().eq_ignore_ascii_case(WEEK_START_HEADER))
        })
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn blank_text_has_no_format() {
            assert_eq!(detect_format(""), None);
            assert_eq!(detect_format("  \n\t\n"), None);
        }

        #[test]
        fn recognizes_both_layouts() {
            assert_eq!(
                detect_format("Intro\n\n# Week of January 8th\n## Sunday\n"),
                Some(Format::List)
            );
            assert_eq!(
                detect_format("\n|  week start|Sunday |\n|---|---|\n"),
                Some(Format::Table)
            );
            assert_eq!(
                detect_format("   # Week of March 3rd\n## Monday\n"),
                Some(Format::List)
            );
        }

        #[test]
        fn unrelated_markdown_is_unrecognized() {
            assert_eq!(detect_format("# Weekly notes\n- [[Pasta]]\n"), None);
            assert_eq!(detect_format("| Name | Qty |\n|---|---|\n| Eggs | 2 |\n"), None);
            assert_eq!(detect_format("Some text # Week of March 3rd"), None);
            assert_eq!(detect_format("    # Week of March 3rd\n## Monday\n"), None);
        }
    }
}

pub mod list {
    //! Outline layout: `# Week of <label>` sections, one `## <Day>` block per day and one
    //! bullet per entry.
    //!
    //! Parsing records the byte range of every piece, so an edited document re-emits
    //! untouched text verbatim and renders only what changed:
    //! - text before the first week, and non-week text between sections, is kept as-is;
    //! - blank lines inside a day stay attached to the entry that follows them;
    //! - a day's trailing blank lines stay behind any entry appended to that day.

    use crate::core::*;
    use crate::layout::MealPlanLayout;
    use crate::parser;
    use crate::week;
    use chrono::{NaiveDate, Weekday};
    use log::debug;

    /// One `## <Day>` block.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct DayBlock {
        pub name: String,
        pub entries: Vec<EntryWithSource>,
        heading: Option<SourceRange>,
        tail: Option<SourceRange>,
    }

    impl DayBlock {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                entries: vec![],
                heading: None,
                tail: None,
            }
        }

        fn remove_recipe(&mut self, name: &str) -> bool {
            match self
                .entries
                .iter()
                .position(|e| e.entry.is_recipe_named(name))
            {
                Some(idx) => {
                    self.entries.remove(idx);
                    true
                }
                None => false,
            }
        }
    }

    /// One `# Week of <label>` section.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct WeekSection {
        pub label: WeekLabel,
        pub days: Vec<DayBlock>,
        header: Option<SourceRange>,
        /// Text between the header and the first day block.
        intro: Option<SourceRange>,
        /// Non-week text between this section and the next week section.
        after: Option<SourceRange>,
    }

    impl WeekSection {
        /// A fresh section with an empty block for every day header.
        pub fn new(label: WeekLabel, day_headers: &[String]) -> Self {
            Self {
                label,
                days: day_headers.iter().map(DayBlock::new).collect(),
                header: None,
                intro: None,
                after: None,
            }
        }

        pub fn day(&self, name: &str) -> Option<&DayBlock> {
            self.days.iter().find(|d| same_day(&d.name, name))
        }

        pub fn day_mut(&mut self, name: &str) -> Option<&mut DayBlock> {
            self.days.iter_mut().find(|d| same_day(&d.name, name))
        }

        pub fn to_week(&self) -> Week {
            let mut week = Week::new(self.label.clone());
            for day in &self.days {
                week.days
                    .entry(day.name.clone())
                    .or_default()
                    .extend(day.entries.iter().map(|e| e.entry.clone()));
            }
            week
        }

        /// Recreates a missing day block at its place in the rotation.
        fn insert_day(&mut self, name: &str, day_headers: &[String]) -> &mut DayBlock {
            let rank = |day: &str| day_headers.iter().position(|h| same_day(h, day));
            let target = rank(name);
            let at = self
                .days
                .iter()
                .position(|d| matches!((rank(&d.name), target), (Some(r), Some(t)) if r > t))
                .unwrap_or(self.days.len());
            self.days.insert(at, DayBlock::new(name));
            &mut self.days[at]
        }

        /// Recreates every day of the rotation the section lacks.
        fn restore_missing_days(&mut self, day_headers: &[String]) {
            for header in day_headers {
                if self.day(header).is_none() {
                    debug!("week of {} has no {header} block; recreating it", self.label);
                    self.insert_day(header, day_headers);
                }
            }
        }
    }

    /// A parsed list-layout document.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ListDocument {
        source: String,
        /// Text before the first week section.
        preamble: SourceRange,
        pub sections: Vec<WeekSection>,
        day_headers: Vec<String>,
        /// Line ending used for rendered pieces, taken from the source.
        newline: &'static str,
    }

    impl ListDocument {
        /// Parses `input`; `day_headers` is the rotation used for sections created later.
        pub fn parse(input: &str, day_headers: &[String]) -> Self {
            let mut sections: Vec<(WeekSection, SourceRange)> = Vec::new();
            let mut current: Option<SectionBuilder> = None;
            let mut offset = 0;

            for raw in input.split_inclusive('\n') {
                let start = offset;
                offset += raw.len();
                let line = raw.trim_end_matches(['\n', '\r']);

                if let Some(label) = parser::week_header(line) {
                    if let Some(builder) = current.take() {
                        sections.push(builder.finish(start));
                    }
                    current = Some(SectionBuilder::new(
                        WeekLabel::new(label),
                        SourceRange::new(start, offset),
                    ));
                } else if parser::is_top_heading(line) {
                    if let Some(builder) = current.take() {
                        sections.push(builder.finish(start));
                    }
                } else if let Some(builder) = current.as_mut() {
                    builder.push_line(line, start, offset);
                }
            }
            if let Some(builder) = current.take() {
                sections.push(builder.finish(input.len()));
            }

            let preamble_end = sections
                .first()
                .map(|(_, span)| span.start)
                .unwrap_or(input.len());
            let next_starts: Vec<usize> = sections
                .iter()
                .skip(1)
                .map(|(_, span)| span.start)
                .chain(std::iter::once(input.len()))
                .collect();
            let sections = sections
                .into_iter()
                .zip(next_starts)
                .map(|((mut section, span), next)| {
                    section.after = Some(SourceRange::new(span.end, next));
                    section
                })
                .collect();

            Self {
                source: input.to_string(),
                preamble: SourceRange::new(0, preamble_end),
                sections,
                day_headers: day_headers.to_vec(),
                newline: dominant_newline(input),
            }
        }

        pub fn preamble(&self) -> &str {
            self.preamble.slice(&self.source)
        }

        /// Non-blank, non-week text found after week sections (e.g. a `# Notes` section).
        pub fn interstitial(&self) -> Vec<&str> {
            self.sections
                .iter()
                .filter_map(|s| s.after.map(|r| r.slice(&self.source)))
                .filter(|text| !text.trim().is_empty())
                .collect()
        }

        /// True when some week carries text between its header and its first day.
        pub fn has_intro_text(&self) -> bool {
            self.sections.iter().any(|s| {
                s.intro
                    .is_some_and(|r| !r.slice(&self.source).trim().is_empty())
            })
        }

        fn render_section(&self, section: &WeekSection, out: &mut String) {
            let src = &self.source;
            let nl = self.newline;
            match section.header {
                Some(range) => out.push_str(range.slice(src)),
                None => {
                    out.push_str("# Week of ");
                    out.push_str(section.label.as_str());
                    out.push_str(nl);
                }
            }
            if let Some(range) = section.intro {
                out.push_str(range.slice(src));
            }
            for day in &section.days {
                match day.heading {
                    Some(range) => out.push_str(range.slice(src)),
                    None => {
                        ensure_newline(out, nl);
                        out.push_str("## ");
                        out.push_str(&day.name);
                        out.push_str(nl);
                    }
                }
                for entry in &day.entries {
                    match entry.source {
                        Some(range) => out.push_str(range.slice(src)),
                        None => {
                            ensure_newline(out, nl);
                            out.push_str(&entry.entry.render_list_item());
                            out.push_str(nl);
                        }
                    }
                }
                if let Some(range) = day.tail {
                    out.push_str(range.slice(src));
                }
            }
            if let Some(range) = section.after {
                out.push_str(range.slice(src));
            }
        }
    }

    impl MealPlanLayout for ListDocument {
        fn format(&self) -> Format {
            Format::List
        }

        fn find_week(&self, label: &WeekLabel) -> Option<usize> {
            self.sections.iter().position(|s| &s.label == label)
        }

        fn insert_week(
            &mut self,
            label: &WeekLabel,
            week_start: NaiveDate,
            start_of_week: Weekday,
        ) -> usize {
            let at = week::first_week_after(
                self.sections.iter().map(|s| &s.label).enumerate(),
                week_start,
                start_of_week,
            )
            .unwrap_or(self.sections.len());
            debug!("creating week of {label} as section {at}");
            self.sections
                .insert(at, WeekSection::new(label.clone(), &self.day_headers));
            at
        }

        fn append_week(&mut self, label: &WeekLabel) -> usize {
            debug!("appending week of {label}");
            self.sections
                .push(WeekSection::new(label.clone(), &self.day_headers));
            self.sections.len() - 1
        }

        fn add_entry(&mut self, week: usize, day: &str, entry: Entry) -> bool {
            let Self {
                sections,
                day_headers,
                ..
            } = self;
            let Some(section) = sections.get_mut(week) else {
                return false;
            };
            section.restore_missing_days(day_headers.as_slice());
            let block = match section.days.iter().position(|d| same_day(&d.name, day)) {
                Some(idx) => &mut section.days[idx],
                None => section.insert_day(day, day_headers.as_slice()),
            };
            block.entries.push(EntryWithSource::new(entry));
            true
        }

        fn remove_recipe(&mut self, week: usize, day: &str, name: &str) -> bool {
            self.sections
                .get_mut(week)
                .and_then(|s| s.day_mut(day))
                .is_some_and(|block| block.remove_recipe(name))
        }

        fn weeks(&self) -> Vec<Week> {
            self.sections.iter().map(WeekSection::to_week).collect()
        }

        fn render(&self) -> String {
            let mut out = String::with_capacity(self.source.len() + 128);
            out.push_str(self.preamble());
            let mut separate_next = false;
            for section in &self.sections {
                let fresh = section.header.is_none();
                if fresh {
                    start_block(&mut out, self.newline);
                } else if separate_next {
                    ensure_newline(&mut out, self.newline);
                    out.push_str(self.newline);
                }
                self.render_section(section, &mut out);
                separate_next = fresh;
            }
            out
        }
    }

    /* ------------------------------ Builders ------------------------------ */

    struct SectionBuilder {
        section: WeekSection,
        start: usize,
        body_start: usize,
        day: Option<DayBuilder>,
    }

    struct DayBuilder {
        block: DayBlock,
        /// Where the next entry's range begins (blank lines before it included).
        pending: usize,
    }

    impl SectionBuilder {
        fn new(label: WeekLabel, header: SourceRange) -> Self {
            Self {
                section: WeekSection {
                    label,
                    days: vec![],
                    header: Some(header),
                    intro: None,
                    after: None,
                },
                start: header.start,
                body_start: header.end,
                day: None,
            }
        }

        fn push_line(&mut self, line: &str, start: usize, end: usize) {
            if let Some(name) = parser::day_heading(line) {
                self.close_day(start);
                if self.section.intro.is_none() {
                    self.section.intro = Some(SourceRange::new(self.body_start, start));
                }
                self.day = Some(DayBuilder {
                    block: DayBlock {
                        name: name.to_string(),
                        entries: vec![],
                        heading: Some(SourceRange::new(start, end)),
                        tail: None,
                    },
                    pending: end,
                });
                return;
            }
            // Lines before the first day block belong to the intro range.
            let Some(day) = self.day.as_mut() else {
                return;
            };
            if line.trim().is_empty() {
                return;
            }
            let entry = parser::list_entry(line);
            day.block
                .entries
                .push(EntryWithSource::from_source(entry, SourceRange::new(day.pending, end)));
            day.pending = end;
        }

        fn close_day(&mut self, at: usize) {
            if let Some(mut day) = self.day.take() {
                day.block.tail = Some(SourceRange::new(day.pending, at));
                self.section.days.push(day.block);
            }
        }

        fn finish(mut self, at: usize) -> (WeekSection, SourceRange) {
            self.close_day(at);
            if self.section.intro.is_none() {
                self.section.intro = Some(SourceRange::new(self.body_start, at));
            }
            (self.section, SourceRange::new(self.start, at))
        }
    }

    /* ------------------------------ Rendering ------------------------------ */

    /// A fresh section: the week header and an empty block per day, newline-terminated.
    pub fn create_week_section(label: &WeekLabel, day_headers: &[String]) -> String {
        render_week(&Week::new(label.clone()), day_headers)
    }

    /// Serializes whole weeks as a standalone list document, one blank line between weeks.
    pub fn render_weeks(weeks: &[Week], day_headers: &[String]) -> String {
        weeks
            .iter()
            .map(|week| render_week(week, day_headers))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn render_week(week: &Week, day_headers: &[String]) -> String {
        let mut out = format!("# Week of {}\n", week.label);
        for day in day_headers {
            out.push_str("## ");
            out.push_str(day);
            out.push('\n');
            for entry in week.entries_for(day) {
                out.push_str(&entry.render_list_item());
                out.push('\n');
            }
        }
        out
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::NaiveDate;

        fn headers() -> Vec<String> {
            day_headers(Weekday::Sun)
        }

        fn date(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).unwrap()
        }

        const DOC: &str = "Meal plan\n\n# Week of January 7th\n## Sunday\n- [x] [[Pasta]]\n\n- leftovers\n## Monday\n\n## Tuesday\n## Wednesday\n## Thursday\n## Friday\n## Saturday\n- [[Pizza]]\n\n# Notes\nbuy basil\n";

        #[test]
        fn parses_sections_days_and_entries() {
            let doc = ListDocument::parse(DOC, &headers());
            assert_eq!(doc.preamble(), "Meal plan\n\n");
            assert_eq!(doc.sections.len(), 1);
            let section = &doc.sections[0];
            assert_eq!(section.label.as_str(), "January 7th");
            assert_eq!(section.days.len(), 7);
            let sunday: Vec<_> = section.days[0].entries.iter().map(|e| &e.entry).collect();
            assert_eq!(
                sunday,
                vec![
                    &Entry::Recipe {
                        name: "Pasta".into(),
                        checkbox: Some(Checkbox::Checked('x')),
                    },
                    &Entry::text("leftovers"),
                ]
            );
            assert_eq!(doc.interstitial(), vec!["# Notes\nbuy basil\n"]);
        }

        #[test]
        fn untouched_document_renders_verbatim() {
            let doc = ListDocument::parse(DOC, &headers());
            assert_eq!(doc.render(), DOC);
        }

        #[test]
        fn appended_entry_lands_before_trailing_blank_lines() {
            let mut doc = ListDocument::parse(DOC, &headers());
            assert!(doc.add_entry(0, "saturday", Entry::recipe("Salad")));
            let rendered = doc.render();
            assert!(rendered.contains("## Saturday\n- [[Pizza]]\n- [[Salad]]\n\n# Notes\nbuy basil\n"));
            assert!(rendered.starts_with("Meal plan\n\n# Week of January 7th\n## Sunday\n- [x] [[Pasta]]\n"));
        }

        #[test]
        fn removal_keeps_checkbox_of_neighbours() {
            let input = "# Week of January 7th\n## Sunday\n- [ ] [[Soup]]\n- [x] [[Pasta]]\n- [X] [[Soup]]\n";
            let mut doc = ListDocument::parse(input, &headers());
            assert!(doc.remove_recipe(0, "Sunday", "Soup"));
            assert_eq!(
                doc.render(),
                "# Week of January 7th\n## Sunday\n- [x] [[Pasta]]\n- [X] [[Soup]]\n"
            );
            assert!(!doc.remove_recipe(0, "Monday", "Soup"));
        }

        #[test]
        fn entry_added_after_unterminated_last_line() {
            let input = "# Week of January 7th\n## Sunday\n- [[Pasta]]";
            let mut doc = ListDocument::parse(input, &headers());
            doc.add_entry(0, "Sunday", Entry::recipe("Soup"));
            assert_eq!(
                doc.render(),
                "# Week of January 7th\n## Sunday\n- [[Pasta]]\n- [[Soup]]\n## Monday\n## Tuesday\n## Wednesday\n## Thursday\n## Friday\n## Saturday\n"
            );
        }

        #[test]
        fn missing_day_blocks_are_recreated_in_rotation_order() {
            let input = "# Week of January 7th\n## Sunday\n## Tuesday\n- [[Tacos]]\n";
            let mut doc = ListDocument::parse(input, &headers());
            doc.add_entry(0, "Monday", Entry::recipe("Curry"));
            assert_eq!(
                doc.render(),
                "# Week of January 7th\n## Sunday\n## Monday\n- [[Curry]]\n## Tuesday\n- [[Tacos]]\n## Wednesday\n## Thursday\n## Friday\n## Saturday\n"
            );
        }

        #[test]
        fn adding_to_a_present_day_still_completes_the_week() {
            let input = "# Week of January 7th\n## Sunday\n- [[Pasta]]\n## Saturday\n";
            let mut doc = ListDocument::parse(input, &headers());
            doc.add_entry(0, "Sunday", Entry::recipe("Soup"));
            let rendered = doc.render();
            assert_eq!(
                rendered,
                "# Week of January 7th\n## Sunday\n- [[Pasta]]\n- [[Soup]]\n## Monday\n## Tuesday\n## Wednesday\n## Thursday\n## Friday\n## Saturday\n"
            );
            let reparsed = ListDocument::parse(&rendered, &headers());
            assert_eq!(reparsed.sections[0].days.len(), 7);
        }

        #[test]
        fn crlf_documents_get_crlf_additions() {
            let input = "Plan\r\n\r\n# Week of January 7th\r\n## Sunday\r\n- [[Pasta]]\r\n## Monday\r\n## Tuesday\r\n## Wednesday\r\n## Thursday\r\n## Friday\r\n## Saturday\r\n";
            let mut doc = ListDocument::parse(input, &headers());
            assert_eq!(doc.render(), input);
            doc.add_entry(0, "Sunday", Entry::recipe("Soup"));
            let at = doc.insert_week(&WeekLabel::new("January 14th"), date(2024, 1, 14), Weekday::Sun);
            doc.add_entry(at, "Monday", Entry::recipe("Chili"));
            let rendered = doc.render();
            assert!(rendered.contains("- [[Pasta]]\r\n- [[Soup]]\r\n## Monday\r\n"));
            assert!(rendered.contains("## Saturday\r\n\r\n# Week of January 14th\r\n## Sunday\r\n## Monday\r\n- [[Chili]]\r\n"));
            assert!(!rendered.replace("\r\n", "").contains('\n'));
        }

        #[test]
        fn new_week_is_placed_chronologically() {
            let input = "# Week of January 7th\n## Sunday\n- [[A]]\n\n# Week of January 21st\n## Sunday\n- [[C]]\n";
            let mut doc = ListDocument::parse(input, &headers());
            let label = WeekLabel::new("January 14th");
            let at = doc.insert_week(&label, date(2024, 1, 14), Weekday::Sun);
            assert_eq!(at, 1);
            let rendered = doc.render();
            let order: Vec<_> = ListDocument::parse(&rendered, &headers())
                .sections
                .iter()
                .map(|s| s.label.as_str().to_string())
                .collect();
            assert_eq!(order, ["January 7th", "January 14th", "January 21st"]);
            assert!(rendered.contains("- [[A]]\n\n# Week of January 14th\n## Sunday\n"));
            assert!(rendered.contains("## Saturday\n\n# Week of January 21st\n"));
        }

        #[test]
        fn later_week_is_appended_with_blank_separator() {
            let input = "# Week of January 7th\n## Sunday\n- [[A]]";
            let mut doc = ListDocument::parse(input, &headers());
            let label = WeekLabel::new("January 14th");
            doc.insert_week(&label, date(2024, 1, 14), Weekday::Sun);
            let rendered = doc.render();
            assert!(rendered.starts_with("# Week of January 7th\n## Sunday\n- [[A]]\n\n# Week of January 14th\n## Sunday\n## Monday\n"));
            assert!(rendered.ends_with("## Saturday\n"));
        }

        #[test]
        fn created_section_has_every_day() {
            let text = create_week_section(&WeekLabel::new("March 3rd"), &day_headers(Weekday::Mon));
            assert_eq!(
                text,
                "# Week of March 3rd\n## Monday\n## Tuesday\n## Wednesday\n## Thursday\n## Friday\n## Saturday\n## Sunday\n"
            );
        }
    }
}

pub mod table {
    //! Grid layout: one Markdown table whose header names `Week Start` and then one column
    //! per day; each data row is a week and each cell lists entries joined by `<br>`.

    use crate::core::*;
    use crate::layout::MealPlanLayout;
    use crate::parser;
    use crate::week;
    use chrono::{NaiveDate, Weekday};
    use log::{debug, warn};

    pub const WEEK_START_HEADER: &str = "Week Start";
    pub const LINE_BREAK: &str = "<br>";

    /* ------------------------------- Tokenizer ------------------------------- */

    /// Raw (untrimmed) cells of a pipe-delimited row, or `None` when `line` is not a row.
    /// Escaped pipes and the alias pipe of a `[[name|alias]]` link do not split cells.
    pub fn split_row(line: &str) -> Option<Vec<&str>> {
        let body = line.trim().strip_prefix('|')?;
        let bytes = body.as_bytes();
        let mut cells = Vec::new();
        let mut start = 0;
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'\\' => {
                    i += 2;
                    continue;
                }
                b'[' if bytes.get(i + 1) == Some(&b'[') => {
                    i += 2 + link_len(&body[i + 2..]).unwrap_or(0);
                    continue;
                }
                b'|' => {
                    cells.push(&body[start..i]);
                    start = i + 1;
                }
                _ => {}
            }
            i += 1;
        }
        let last = &body[start.min(body.len())..];
        if !last.trim().is_empty() {
            cells.push(last);
        }
        Some(cells)
    }

    /// Length of a link body up to and including its closing `]]`. A body that opens another
    /// link or holds more than one unescaped pipe is not a link, so an unclosed `[[` never
    /// swallows the cell boundaries after it.
    fn link_len(after_open: &str) -> Option<usize> {
        let close = after_open.find("]]")?;
        let inner = &after_open[..close];
        let pipes = inner
            .char_indices()
            .filter(|&(at, c)| c == '|' && !inner[..at].ends_with('\\'))
            .count();
        (!inner.contains("[[") && pipes <= 1).then_some(close + 2)
    }

    /// Every non-empty cell is a dash run (alignment colons allowed), and at least one
    /// cell is non-empty.
    pub fn is_separator_row(cells: &[&str]) -> bool {
        let mut filled = cells
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .peekable();
        filled.peek().is_some()
            && filled.all(|c| {
                let dashes = c.trim_start_matches(':').trim_end_matches(':');
                !dashes.is_empty() && dashes.chars().all(|ch| ch == '-')
            })
    }

    /* --------------------------------- Rows --------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Cell {
        raw: String,
        entries: Vec<Entry>,
        dirty: bool,
    }

    impl Cell {
        fn parse(raw: &str) -> Self {
            Self {
                raw: raw.to_string(),
                entries: parser::cell_entries(raw),
                dirty: false,
            }
        }

        fn blank() -> Self {
            Self {
                raw: "  ".to_string(),
                entries: vec![],
                dirty: false,
            }
        }

        fn render(&self) -> String {
            if !self.dirty {
                return self.raw.clone();
            }
            let joined = self
                .entries
                .iter()
                .map(Entry::render_cell)
                .collect::<Vec<_>>()
                .join(LINE_BREAK);
            format!(" {joined} ")
        }
    }

    /// A data row; cell 0 is the week label column.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct WeekRow {
        pub label: WeekLabel,
        cells: Vec<Cell>,
    }

    impl WeekRow {
        fn new(label: &WeekLabel, columns: usize) -> Self {
            let mut cells = vec![Cell::parse(&format!(" {label} "))];
            cells.resize_with(columns.max(1), Cell::blank);
            Self {
                label: label.clone(),
                cells,
            }
        }

        pub fn entries(&self, column: usize) -> &[Entry] {
            self.cells
                .get(column)
                .map(|c| c.entries.as_slice())
                .unwrap_or(&[])
        }

        fn cell_mut(&mut self, column: usize) -> &mut Cell {
            if self.cells.len() <= column {
                self.cells.resize_with(column + 1, Cell::blank);
            }
            &mut self.cells[column]
        }

        fn render(&self) -> String {
            let cells: Vec<String> = self.cells.iter().map(Cell::render).collect();
            format!("|{}|", cells.join("|"))
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum TableRow {
        Week(WeekRow),
        /// Every cell blank. Kept in place and never treated as a week.
        Placeholder,
        /// Blank week label but some content. Kept verbatim, never matched or ordered.
        Unlabeled,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct RowWithSource {
        pub row: TableRow,
        source: Option<SourceRange>,
        ending: &'static str,
    }

    impl RowWithSource {
        fn fresh(row: WeekRow, ending: &'static str) -> Self {
            Self {
                row: TableRow::Week(row),
                source: None,
                ending,
            }
        }
    }

    fn classify(cells: &[&str]) -> TableRow {
        if cells.iter().all(|c| c.trim().is_empty()) {
            return TableRow::Placeholder;
        }
        if cells[0].trim().is_empty() {
            return TableRow::Unlabeled;
        }
        TableRow::Week(WeekRow {
            label: WeekLabel::new(cells[0]),
            cells: cells.iter().map(|c| Cell::parse(c)).collect(),
        })
    }

    fn line_ending(line: &str) -> &'static str {
        if line.ends_with("\r\n") {
            "\r\n"
        } else if line.ends_with('\n') {
            "\n"
        } else {
            ""
        }
    }

    /* --------------------------------- Table --------------------------------- */

    /// A parsed table-layout document.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct MealTable {
        source: String,
        /// Text before the header row (leading blank lines included).
        before: SourceRange,
        header: SourceRange,
        separator: SourceRange,
        pub columns: Vec<String>,
        pub rows: Vec<RowWithSource>,
        /// Text after the last row.
        after: SourceRange,
        newline: &'static str,
    }

    impl MealTable {
        /// Locates the header row (the first `Week Start` row, else the first pipe row),
        /// the separator directly below it and the rows that follow.
        /// `None` when there is no such header/separator pair.
        pub fn parse(input: &str) -> Option<Self> {
            let mut lines: Vec<(SourceRange, &str)> = Vec::new();
            let mut offset = 0;
            for raw in input.split_inclusive('\n') {
                lines.push((
                    SourceRange::new(offset, offset + raw.len()),
                    raw.trim_end_matches(['\n', '\r']),
                ));
                offset += raw.len();
            }

            let header_idx = lines
                .iter()
                .position(|(_, line)| {
                    split_row(line).is_some_and(|cells| {
                        cells.first().is_some_and(|c| {
                            c.trim().eq_ignore_ascii_case(WEEK_START_HEADER)
                        })
                    })
                })
                .or_else(|| lines.iter().position(|(_, line)| split_row(line).is_some()))?;

            let (header, header_line) = lines[header_idx];
            let columns: Vec<String> = split_row(header_line)?
                .iter()
                .map(|c| c.trim().to_string())
                .collect();
            let (separator, separator_line) = *lines.get(header_idx + 1)?;
            if !split_row(separator_line).is_some_and(|cells| is_separator_row(&cells)) {
                debug!("pipe row without a separator below it; not a meal plan table");
                return None;
            }

            let mut rows = Vec::new();
            let mut end = separator.end;
            for (range, line) in &lines[header_idx + 2..] {
                let Some(cells) = split_row(line) else {
                    break;
                };
                rows.push(RowWithSource {
                    row: classify(&cells),
                    source: Some(*range),
                    ending: line_ending(range.slice(input)),
                });
                end = range.end;
            }

            Some(Self {
                source: input.to_string(),
                before: SourceRange::new(0, header.start),
                header,
                separator,
                columns,
                rows,
                after: SourceRange::new(end, input.len()),
                newline: dominant_newline(input),
            })
        }

        pub fn before_text(&self) -> &str {
            self.before.slice(&self.source)
        }

        pub fn after_text(&self) -> &str {
            self.after.slice(&self.source)
        }

        /// Column holding `day`, resolved from the header so custom day orders work.
        pub fn column_index(&self, day: &str) -> Option<usize> {
            self.columns
                .iter()
                .enumerate()
                .skip(1)
                .find(|(_, name)| same_day(name, day))
                .map(|(idx, _)| idx)
        }

        pub fn week_rows(&self) -> impl Iterator<Item = (usize, &WeekRow)> + '_ {
            self.rows
                .iter()
                .enumerate()
                .filter_map(|(idx, r)| match &r.row {
                    TableRow::Week(week) => Some((idx, week)),
                    TableRow::Placeholder | TableRow::Unlabeled => None,
                })
        }

        fn after_last_week_row(&self) -> usize {
            self.week_rows().last().map(|(idx, _)| idx + 1).unwrap_or(0)
        }

        fn edit_cell(
            &mut self,
            row: usize,
            day: &str,
            edit: impl FnOnce(&mut Vec<Entry>) -> bool,
        ) -> bool {
            let Some(column) = self.column_index(day) else {
                warn!("meal plan table has no {day:?} column");
                return false;
            };
            let Some(row) = self.rows.get_mut(row) else {
                return false;
            };
            let TableRow::Week(week) = &mut row.row else {
                return false;
            };
            let cell = week.cell_mut(column);
            if !edit(&mut cell.entries) {
                return false;
            }
            cell.dirty = true;
            row.source = None;
            true
        }
    }

    impl MealPlanLayout for MealTable {
        fn format(&self) -> Format {
            Format::Table
        }

        fn find_week(&self, label: &WeekLabel) -> Option<usize> {
            self.week_rows()
                .find(|(_, week)| &week.label == label)
                .map(|(idx, _)| idx)
        }

        fn insert_week(
            &mut self,
            label: &WeekLabel,
            week_start: NaiveDate,
            start_of_week: Weekday,
        ) -> usize {
            let later = week::first_week_after(
                self.week_rows().map(|(idx, week)| (idx, &week.label)),
                week_start,
                start_of_week,
            );
            let at = later.unwrap_or_else(|| self.after_last_week_row());
            debug!("creating week of {label} as table row {at}");
            let row = WeekRow::new(label, self.columns.len());
            self.rows.insert(at, RowWithSource::fresh(row, self.newline));
            at
        }

        fn append_week(&mut self, label: &WeekLabel) -> usize {
            let at = self.after_last_week_row();
            debug!("appending week of {label} as table row {at}");
            let row = WeekRow::new(label, self.columns.len());
            self.rows.insert(at, RowWithSource::fresh(row, self.newline));
            at
        }

        fn add_entry(&mut self, week: usize, day: &str, entry: Entry) -> bool {
            self.edit_cell(week, day, |entries| {
                entries.push(entry);
                true
            })
        }

        fn remove_recipe(&mut self, week: usize, day: &str, name: &str) -> bool {
            self.edit_cell(week, day, |entries| {
                match entries.iter().position(|e| e.is_recipe_named(name)) {
                    Some(idx) => {
                        entries.remove(idx);
                        true
                    }
                    None => false,
                }
            })
        }

        fn weeks(&self) -> Vec<Week> {
            self.week_rows()
                .map(|(_, row)| {
                    let mut week = Week::new(row.label.clone());
                    for (column, name) in self.columns.iter().enumerate().skip(1) {
                        week.days.insert(name.clone(), row.entries(column).to_vec());
                    }
                    week
                })
                .collect()
        }

        fn render(&self) -> String {
            let src = &self.source;
            let mut out = String::with_capacity(src.len() + 128);
            out.push_str(self.before.slice(src));
            out.push_str(self.header.slice(src));
            out.push_str(self.separator.slice(src));
            for row in &self.rows {
                match (row.source, &row.row) {
                    (Some(range), _) => out.push_str(range.slice(src)),
                    (None, TableRow::Week(week)) => {
                        ensure_newline(&mut out, self.newline);
                        out.push_str(&week.render());
                        out.push_str(row.ending);
                    }
                    (None, TableRow::Placeholder | TableRow::Unlabeled) => {}
                }
            }
            if !self.after.is_empty() {
                ensure_newline(&mut out, self.newline);
            }
            out.push_str(self.after.slice(src));
            out
        }
    }

    /* ------------------------------ Primitives ------------------------------ */

    /// Appends `[[recipe_name]]` to `day` in the row labelled `week_label`.
    ///
    /// Returns `content` unchanged when there is no table, no such row or no such column;
    /// creating missing weeks is the caller's job.
    pub fn add_recipe_to_table(
        content: &str,
        week_label: &str,
        day: &str,
        recipe_name: &str,
    ) -> String {
        let Some(mut table) = MealTable::parse(content) else {
            return content.to_string();
        };
        let label = WeekLabel::new(week_label);
        let Some(row) = table.find_week(&label) else {
            debug!("no row for week of {label}; leaving table unchanged");
            return content.to_string();
        };
        if table.add_entry(row, day, Entry::recipe(recipe_name)) {
            table.render()
        } else {
            content.to_string()
        }
    }

    /// A row with `week_label` in the first column and `day_count` empty cells, no line ending.
    pub fn create_table_week_row(week_label: &str, day_count: usize) -> String {
        WeekRow::new(&WeekLabel::new(week_label), day_count + 1).render()
    }

    /// Header and separator rows for `day_headers`, each newline-terminated.
    pub fn create_table(day_headers: &[String]) -> String {
        let mut header = vec![WEEK_START_HEADER.to_string()];
        header.extend(day_headers.iter().cloned());
        format!(
            "| {} |\n|{}|\n",
            header.join(" | "),
            vec![" --- "; header.len()].join("|")
        )
    }

    /// Serializes whole weeks as a standalone table in `day_headers` order.
    pub fn render_weeks(weeks: &[Week], day_headers: &[String]) -> String {
        let mut out = create_table(day_headers);
        for week in weeks {
            let mut row = WeekRow::new(&week.label, day_headers.len() + 1);
            for (idx, day) in day_headers.iter().enumerate() {
                let cell = row.cell_mut(idx + 1);
                cell.entries = week.entries_for(day).to_vec();
                cell.dirty = true;
            }
            out.push_str(&row.render());
            out.push('\n');
        }
        out
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::NaiveDate;

        const HEADER: &str = "| Week Start | Sunday | Monday | Tuesday | Wednesday | Thursday | Friday | Saturday |\n| --- | --- | --- | --- | --- | --- | --- | --- |\n";

        fn date(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).unwrap()
        }

        fn labels(table: &MealTable) -> Vec<String> {
            table
                .week_rows()
                .map(|(_, w)| w.label.as_str().to_string())
                .collect()
        }

        #[test]
        fn tokenizer_tolerates_spacing_and_link_pipes() {
            assert_eq!(
                split_row("  |a|  b | [[x|y]] | c \\| d |"),
                Some(vec!["a", "  b ", " [[x|y]] ", " c \\| d "])
            );
            assert_eq!(split_row("| a | b"), Some(vec![" a ", " b"]));
            assert_eq!(split_row("a | b"), None);
            assert_eq!(
                split_row("| [[oops | [[Soup]] | [[a|b|c]] |"),
                Some(vec![" [[oops ", " [[Soup]] ", " [[a", "b", "c]] "])
            );
            assert!(is_separator_row(&["---", " - ", "  ------ "]));
            assert!(is_separator_row(&[" --- ", "  "]));
            assert!(is_separator_row(&[":---", "---:", ":-:"]));
            assert!(!is_separator_row(&["abc", "---"]));
            assert!(!is_separator_row(&["  ", ""]));
        }

        #[test]
        fn appends_to_existing_cell_with_line_break() {
            let content = format!("{HEADER}| January 8th |  | [[Pasta Carbonara]] |  |  |  |  |  |\n");
            let out = add_recipe_to_table(&content, "January 8th", "Monday", "Chicken Tikka Masala");
            assert_eq!(
                out,
                format!("{HEADER}| January 8th |  | [[Pasta Carbonara]]<br>[[Chicken Tikka Masala]] |  |  |  |  |  |\n")
            );
        }

        #[test]
        fn blank_cell_becomes_single_entry() {
            let content = format!("{HEADER}| January 8th |  |  |  |  |  |  |  |\n");
            let out = add_recipe_to_table(&content, " January 8th ", "Friday", "Tacos");
            assert_eq!(
                out,
                format!("{HEADER}| January 8th |  |  |  |  |  | [[Tacos]] |  |\n")
            );
        }

        #[test]
        fn unclosed_link_does_not_merge_cells() {
            let content = format!("{HEADER}| January 7th |  | [[oops |  | x |  |  |  |\n");
            let out = add_recipe_to_table(&content, "January 7th", "Friday", "Tacos");
            assert_eq!(
                out,
                format!("{HEADER}| January 7th |  | [[oops |  | x |  | [[Tacos]] |  |\n")
            );
            let table = MealTable::parse(&out).unwrap();
            let week = &table.weeks()[0];
            assert_eq!(week.entries_for("Monday"), &[Entry::text("[[oops")]);
            assert_eq!(week.entries_for("Friday"), &[Entry::recipe("Tacos")]);
        }

        #[test]
        fn crlf_table_gains_crlf_rows() {
            let content = format!("{HEADER}| January 7th |  |  |  |  |  |  |  |\n").replace('\n', "\r\n");
            let mut table = MealTable::parse(&content).unwrap();
            assert_eq!(table.render(), content);
            let at = table.append_week(&WeekLabel::new("January 14th"));
            assert!(table.add_entry(at, "Monday", Entry::recipe("Soup")));
            let rendered = table.render();
            assert!(rendered.starts_with(&content));
            assert!(rendered.ends_with("| January 14th |  | [[Soup]] |  |  |  |  |  |\r\n"));
            assert!(!rendered.replace("\r\n", "").contains('\n'));
        }

        #[test]
        fn absent_week_leaves_content_unchanged() {
            let content = format!("{HEADER}|  |  |  |  |  |  |  |  |\n| January 8th |  | [[Pasta]] |  |  |  |  |  |\n");
            assert_eq!(add_recipe_to_table(&content, "February 1st", "Monday", "Soup"), content);
            assert_eq!(add_recipe_to_table("just text", "January 8th", "Monday", "Soup"), "just text");
        }

        #[test]
        fn custom_column_order_is_respected() {
            let content = "| Week Start | Monday | Sunday |\n|-|-|\n| March 3rd | | |\n";
            let out = add_recipe_to_table(content, "March 3rd", "Sunday", "Roast");
            assert_eq!(
                out,
                "| Week Start | Monday | Sunday |\n|-|-|\n| March 3rd | | [[Roast]] |\n"
            );
        }

        #[test]
        fn created_row_has_label_and_blank_cells() {
            assert_eq!(
                create_table_week_row("January 8th", 7),
                "| January 8th |  |  |  |  |  |  |  |"
            );
        }

        #[test]
        fn removal_repairs_line_breaks_wherever_the_entry_sits() {
            let cases = [
                ("A", "[[B]]<br>[[C]]"),
                ("B", "[[A]]<br>[[C]]"),
                ("C", "[[A]]<br>[[B]]"),
            ];
            for (removed, expected) in cases {
                let content = format!("{HEADER}| January 7th |  | [[A]]<br>[[B]]<BR/>[[C]] |  |  |  |  |  |\n");
                let mut table = MealTable::parse(&content).unwrap();
                assert!(table.remove_recipe(0, "Monday", removed));
                let rendered = table.render();
                assert_eq!(
                    rendered,
                    format!("{HEADER}| January 7th |  | {expected} |  |  |  |  |  |\n"),
                    "removing {removed}"
                );
                assert!(!rendered.contains("<br><br>"));
                assert!(!rendered.contains("| <br>"));
                assert!(!rendered.contains("<br> |"));
            }
        }

        #[test]
        fn new_rows_keep_data_rows_ordered_and_skip_placeholders() {
            let content = format!(
                "\n\n{HEADER}|  |  |  |  |  |  |  |  |\n| January 7th |  |  |  |  |  |  |  |\n|  |  |  |  |  |  |  |  |\n| January 21st |  |  |  |  |  |  |  |\nafter the table\n"
            );
            let mut table = MealTable::parse(&content).unwrap();
            let at = table.insert_week(&WeekLabel::new("January 14th"), date(2024, 1, 14), Weekday::Sun);
            assert_eq!(at, 3);
            table.insert_week(&WeekLabel::new("December 31st"), date(2023, 12, 31), Weekday::Sun);
            table.insert_week(&WeekLabel::new("January 28th"), date(2024, 1, 28), Weekday::Sun);
            let rendered = table.render();
            let reparsed = MealTable::parse(&rendered).unwrap();
            assert_eq!(
                labels(&reparsed),
                ["December 31st", "January 7th", "January 14th", "January 21st", "January 28th"]
            );
            assert!(rendered.starts_with(&format!(
                "\n\n{HEADER}|  |  |  |  |  |  |  |  |\n| December 31st |"
            )));
            assert!(rendered.ends_with("| January 28th |  |  |  |  |  |  |  |\nafter the table\n"));
            assert_eq!(
                reparsed.rows.iter().filter(|r| r.row == TableRow::Placeholder).count(),
                2
            );
        }

        #[test]
        fn first_row_goes_directly_under_separator() {
            let content = format!("{HEADER}|  |  |  |  |  |  |  |  |\n");
            let mut table = MealTable::parse(&content).unwrap();
            assert_eq!(table.append_week(&WeekLabel::new("January 7th")), 0);
            assert_eq!(
                table.render(),
                format!("{HEADER}| January 7th |  |  |  |  |  |  |  |\n|  |  |  |  |  |  |  |  |\n")
            );
        }

        #[test]
        fn unterminated_table_gains_row_on_new_line() {
            let content = HEADER.trim_end();
            let mut table = MealTable::parse(content).unwrap();
            table.append_week(&WeekLabel::new("January 7th"));
            assert_eq!(
                table.render(),
                format!("{HEADER}| January 7th |  |  |  |  |  |  |  |\n")
            );
        }

        #[test]
        fn header_without_separator_is_not_a_table() {
            assert!(MealTable::parse("| Week Start | Sunday |\n| January 7th | |\n").is_none());
        }

        #[test]
        fn rendered_weeks_round_trip_through_parser() {
            let mut week = Week::new(WeekLabel::new("January 7th"));
            week.days.insert(
                "Monday".into(),
                vec![Entry::recipe("Soup"), Entry::text("bread | butter")],
            );
            let headers = day_headers(Weekday::Sun);
            let text = render_weeks(&[week], &headers);
            assert_eq!(
                text,
                format!("{HEADER}| January 7th |  | [[Soup]]<br>bread \\| butter |  |  |  |  |  |\n")
            );
            let table = MealTable::parse(&text).unwrap();
            assert_eq!(
                table.weeks()[0].entries_for("monday"),
                &[Entry::recipe("Soup"), Entry::text("bread | butter")]
            );
        }
    }
}

pub mod layout {
    //! The seam between the mutation operations and the two codecs.

    use crate::core::{Entry, Format, Week, WeekLabel};
    use crate::detect::detect_format;
    use crate::list::ListDocument;
    use crate::table::MealTable;
    use chrono::{NaiveDate, Weekday};

    /// A parsed meal plan document in either layout. Weeks are addressed by index.
    pub trait MealPlanLayout {
        fn format(&self) -> Format;

        fn find_week(&self, label: &WeekLabel) -> Option<usize>;

        /// Creates an empty week so that weeks stay in chronological order.
        fn insert_week(
            &mut self,
            label: &WeekLabel,
            week_start: NaiveDate,
            start_of_week: Weekday,
        ) -> usize;

        /// Creates an empty week after the last existing one.
        fn append_week(&mut self, label: &WeekLabel) -> usize;

        /// Appends `entry` to `day`; false when nothing was changed.
        fn add_entry(&mut self, week: usize, day: &str, entry: Entry) -> bool;

        /// Removes the first recipe named `name` from `day`; false when none matched.
        fn remove_recipe(&mut self, week: usize, day: &str, name: &str) -> bool;

        fn weeks(&self) -> Vec<Week>;

        /// Full document text; untouched regions are reproduced byte-for-byte.
        fn render(&self) -> String;
    }

    /// Detects the layout of `content` and parses it.
    pub fn open_layout(content: &str, day_headers: &[String]) -> Option<Box<dyn MealPlanLayout>> {
        match detect_format(content)? {
            Format::List => Some(Box::new(ListDocument::parse(content, day_headers))),
            Format::Table => {
                MealTable::parse(content).map(|t| Box::new(t) as Box<dyn MealPlanLayout>)
            }
        }
    }
}

pub mod ops {
    //! The three edits a meal plan supports, as pure text-in/text-out transforms.
    //!
    //! Each call parses the whole note, edits the target week and re-renders it. When the
    //! edit turns out to be a no-op the input is returned unchanged.

    use crate::core::*;
    use crate::detect::detect_format;
    use crate::layout::{MealPlanLayout, open_layout};
    use crate::list::ListDocument;
    use crate::settings::Settings;
    use crate::table::{self, MealTable};
    use crate::week;
    use chrono::{Datelike, NaiveDate};
    use log::{debug, warn};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Placement {
        /// The current week is the newest one by construction.
        End,
        Chronological,
    }

    /// Adds `recipe` to `day` of the week containing `today`.
    pub fn add_recipe_to_current_week(
        content: &str,
        settings: &Settings,
        today: NaiveDate,
        recipe: &str,
        day: &str,
    ) -> Result<String, DomainError> {
        add_recipe(content, settings, today, recipe, day, Placement::End)
    }

    /// Adds `recipe` to `day` of the week containing `date`, creating that week in
    /// chronological position when the note does not have it yet.
    pub fn add_recipe_by_date(
        content: &str,
        settings: &Settings,
        date: NaiveDate,
        recipe: &str,
        day: &str,
    ) -> Result<String, DomainError> {
        add_recipe(content, settings, date, recipe, day, Placement::Chronological)
    }

    /// Removes the first `recipe` scheduled on `date`. Other weeks are never touched.
    pub fn remove_recipe_by_date(
        content: &str,
        settings: &Settings,
        date: NaiveDate,
        recipe: &str,
    ) -> Result<String, DomainError> {
        let start_of_week = settings.start_of_week()?;
        let headers = day_headers(start_of_week);
        let label = week::week_start_label(date, start_of_week);
        let day = day_name(date.weekday());

        let Some(mut layout) = open_layout(content, &headers) else {
            debug!("note has no meal plan; nothing to remove");
            return Ok(content.to_string());
        };
        let Some(idx) = layout.find_week(&label) else {
            debug!("no week of {label} in the meal plan; nothing to remove");
            return Ok(content.to_string());
        };
        if layout.remove_recipe(idx, day, recipe) {
            Ok(layout.render())
        } else {
            debug!("{recipe:?} is not planned on {day}, week of {label}");
            Ok(content.to_string())
        }
    }

    fn add_recipe(
        content: &str,
        settings: &Settings,
        date: NaiveDate,
        recipe: &str,
        day: &str,
        placement: Placement,
    ) -> Result<String, DomainError> {
        let start_of_week = settings.start_of_week()?;
        let day = parse_day_name(day)
            .map(day_name)
            .ok_or_else(|| DomainError::UnknownDay(day.to_string()))?;
        let recipe = recipe.trim();
        if recipe.is_empty() {
            return Err(DomainError::EmptyRecipeName);
        }
        let headers = day_headers(start_of_week);
        let week_start = week::week_start(date, start_of_week);
        let label = week::format_label(week_start);

        let Some(mut layout) = open_or_init(content, settings.meal_plan_format, &headers) else {
            warn!("meal plan table has no separator row; leaving the note unchanged");
            return Ok(content.to_string());
        };
        let idx = match layout.find_week(&label) {
            Some(idx) => idx,
            None => match placement {
                Placement::End => layout.append_week(&label),
                Placement::Chronological => layout.insert_week(&label, week_start, start_of_week),
            },
        };
        if !layout.add_entry(idx, day, Entry::recipe(recipe)) {
            warn!("could not add {recipe:?} to {day}, week of {label}");
            return Ok(content.to_string());
        }
        Ok(layout.render())
    }

    /// Parses the note in its own layout. A note with no meal plan yet gets an empty one in
    /// `format`, after any text it already holds.
    fn open_or_init(
        content: &str,
        format: Format,
        headers: &[String],
    ) -> Option<Box<dyn MealPlanLayout>> {
        if detect_format(content).is_some() {
            return open_layout(content, headers);
        }
        debug!("starting a new {format} meal plan");
        match format {
            Format::List => Some(Box::new(ListDocument::parse(content, headers))),
            Format::Table => {
                let newline = dominant_newline(content);
                let mut seeded = content.to_string();
                start_block(&mut seeded, newline);
                seeded.push_str(&with_newline(table::create_table(headers), newline));
                MealTable::parse(&seeded).map(|t| Box::new(t) as Box<dyn MealPlanLayout>)
            }
        }
    }

}

pub mod convert {
    //! Whole-document conversion between the two layouts.
    //!
    //! Every week is read into the shared model and written back out in the target layout.
    //! Text outside the plan is carried over; checkbox state has no table form and is lost
    //! on the way to a table.

    use crate::core::*;
    use crate::detect::detect_format;
    use crate::layout::MealPlanLayout;
    use crate::list::{self, ListDocument};
    use crate::table::{self, MealTable, TableRow};
    use log::{debug, warn};

    pub fn convert_list_to_table(content: &str, day_headers: &[String]) -> String {
        let doc = ListDocument::parse(content, day_headers);
        if doc.sections.is_empty() {
            debug!("no list weeks to convert");
            return content.to_string();
        }
        let weeks = doc.weeks();
        if doc.has_intro_text() {
            warn!("text between a week header and its first day has no table form; dropping it");
        }
        if weeks.iter().any(|w| has_unknown_day(w, day_headers)) {
            warn!("entries under headings that are not day names have no table form; dropping them");
        }
        let checked = weeks
            .iter()
            .flat_map(|w| w.days.values().flatten())
            .filter(|e| matches!(e, Entry::Recipe { checkbox: Some(_), .. }))
            .count();
        if checked > 0 {
            warn!("{checked} checkbox marker(s) have no table form; dropping them");
        }

        let newline = dominant_newline(content);
        let mut out = doc.preamble().to_string();
        start_block(&mut out, newline);
        out.push_str(&with_newline(table::render_weeks(&weeks, day_headers), newline));
        for text in doc.interstitial() {
            start_block(&mut out, newline);
            out.push_str(text);
        }
        out
    }

    pub fn convert_table_to_list(content: &str, day_headers: &[String]) -> String {
        let Some(table) = MealTable::parse(content) else {
            debug!("no table to convert");
            return content.to_string();
        };
        if table.rows.iter().any(|r| r.row == TableRow::Unlabeled) {
            warn!("table rows without a week label have no list form; dropping them");
        }
        let weeks = table.weeks();
        if weeks.iter().any(|w| has_unknown_day(w, day_headers)) {
            warn!("table columns that are not day names have no list form; dropping them");
        }

        let newline = dominant_newline(content);
        let mut out = table.before_text().to_string();
        start_block(&mut out, newline);
        out.push_str(&with_newline(list::render_weeks(&weeks, day_headers), newline));
        let after = table.after_text();
        if !after.trim().is_empty() {
            start_block(&mut out, newline);
            out.push_str(after.trim_start_matches(['\n', '\r']));
        }
        out
    }

    /// Rewrites `content` in `target` layout. Notes already in that layout, or with no
    /// meal plan at all, come back unchanged.
    pub fn convert(content: &str, target: Format, day_headers: &[String]) -> String {
        match (detect_format(content), target) {
            (Some(Format::List), Format::Table) => convert_list_to_table(content, day_headers),
            (Some(Format::Table), Format::List) => convert_table_to_list(content, day_headers),
            (found, _) => {
                debug!("nothing to convert (found {found:?}, want {target})");
                content.to_string()
            }
        }
    }

    fn has_unknown_day(week: &Week, day_headers: &[String]) -> bool {
        week.days.iter().any(|(day, entries)| {
            !entries.is_empty() && !day_headers.iter().any(|h| same_day(h, day))
        })
    }

}

pub mod settings {
    //! User settings for the meal plan and how they are loaded.

    use crate::core::{DomainError, Format, day_headers, weekday_from_index};
    use chrono::Weekday;
    use config::{Config, ConfigError, Environment, File};
    use regex::Regex;
    use serde::{Deserialize, Serialize};
    use std::path::{Path, PathBuf};

    /// Base name of the optional settings file looked up in the working directory.
    pub const SETTINGS_FILE: &str = "mealplan";
    pub const ENV_PREFIX: &str = "MEALPLAN";

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Settings {
        /// First day of the week, 0 = Sunday .. 6 = Saturday.
        pub start_of_week: u8,
        /// Layout used when a note has no meal plan yet.
        pub meal_plan_format: Format,
        /// Meal plan note, relative to `vault_root`.
        pub meal_plan_note: String,
        pub vault_root: PathBuf,
        /// Folder holding recipe notes, relative to `vault_root`.
        pub recipe_directory: PathBuf,
        /// Regular expressions for recipe paths to skip.
        pub ignore_patterns: Vec<String>,
    }

    impl Default for Settings {
        fn default() -> Self {
            Self {
                start_of_week: 0,
                meal_plan_format: Format::List,
                meal_plan_note: "Meal Plan".to_string(),
                vault_root: PathBuf::from("."),
                recipe_directory: PathBuf::from("Recipes"),
                ignore_patterns: vec![],
            }
        }
    }

    impl Settings {
        pub fn start_of_week(&self) -> Result<Weekday, DomainError> {
            weekday_from_index(self.start_of_week)
        }

        /// Day names in rotation order starting at the configured first day.
        pub fn day_headers(&self) -> Result<Vec<String>, DomainError> {
            Ok(day_headers(self.start_of_week()?))
        }

        /// Location of the meal plan note; `.md` is assumed when the note has no extension.
        pub fn meal_plan_path(&self) -> PathBuf {
            let mut path = self.vault_root.join(&self.meal_plan_note);
            if path.extension().is_none() {
                path.set_extension("md");
            }
            path
        }

        pub fn recipe_path(&self) -> PathBuf {
            self.vault_root.join(&self.recipe_directory)
        }

        pub fn ignore_list(&self) -> Result<IgnoreList, DomainError> {
            IgnoreList::compile(&self.ignore_patterns)
        }
    }

    /// Loads settings with the following priority (highest to lowest):
    /// 1. environment variables such as `MEALPLAN__START_OF_WEEK`
    /// 2. `explicit`, or else an optional `mealplan.toml` in the working directory
    /// 3. default values
    pub fn load_settings(explicit: Option<&Path>) -> Result<Settings, ConfigError> {
        let file = match explicit {
            Some(path) => File::from(path).required(true),
            None => File::with_name(SETTINGS_FILE).required(false),
        };
        let settings = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        settings.try_deserialize()
    }

    /// Compiled ignore patterns for recipe paths.
    #[derive(Debug, Clone, Default)]
    pub struct IgnoreList {
        patterns: Vec<Regex>,
    }

    impl IgnoreList {
        /// Compiles every pattern; the first malformed one is reported with the compiler's message.
        pub fn compile(
            patterns: impl IntoIterator<Item = impl AsRef<str>>,
        ) -> Result<Self, DomainError> {
            let patterns = patterns
                .into_iter()
                .map(|p| {
                    Regex::new(p.as_ref()).map_err(|err| DomainError::InvalidIgnorePattern {
                        pattern: p.as_ref().to_string(),
                        message: err.to_string(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Self { patterns })
        }

        pub fn is_ignored(&self, path: &str) -> bool {
            self.patterns.iter().any(|re| re.is_match(path))
        }

        pub fn is_empty(&self) -> bool {
            self.patterns.is_empty()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::fs;

        #[test]
        fn defaults_match_a_fresh_vault() {
            let settings = Settings::default();
            assert_eq!(settings.start_of_week(), Ok(Weekday::Sun));
            assert_eq!(settings.meal_plan_path(), PathBuf::from("./Meal Plan.md"));
            assert_eq!(settings.recipe_path(), PathBuf::from("./Recipes"));
            assert!(settings.ignore_list().unwrap().is_empty());
        }

        #[test]
        fn note_extension_is_kept() {
            let settings = Settings {
                meal_plan_note: "plans/dinner.markdown".into(),
                vault_root: PathBuf::from("/vault"),
                ..Settings::default()
            };
            assert_eq!(settings.meal_plan_path(), PathBuf::from("/vault/plans/dinner.markdown"));
        }

        #[test]
        fn loads_explicit_file_over_defaults() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("mealplan.toml");
            fs::write(
                &path,
                "start_of_week = 1\nmeal_plan_format = \"table\"\nignore_patterns = [\"^Drafts/\"]\n",
            )
            .expect("write settings");

            let settings = load_settings(Some(&path)).expect("load settings");
            assert_eq!(settings.start_of_week(), Ok(Weekday::Mon));
            assert_eq!(settings.meal_plan_format, Format::Table);
            assert_eq!(settings.meal_plan_note, "Meal Plan");
            assert_eq!(settings.day_headers().unwrap()[0], "Monday");
            assert!(settings.ignore_list().unwrap().is_ignored("Drafts/Soup.md"));
        }

        #[test]
        fn missing_explicit_file_is_an_error() {
            let tmp = tempfile::tempdir().expect("tempdir");
            assert!(load_settings(Some(&tmp.path().join("absent.toml"))).is_err());
        }

        #[test]
        fn malformed_ignore_pattern_is_reported() {
            let err = IgnoreList::compile(["ok", "(unclosed"]).unwrap_err();
            match err {
                DomainError::InvalidIgnorePattern { pattern, message } => {
                    assert_eq!(pattern, "(unclosed");
                    assert!(!message.is_empty());
                }
                other => panic!("unexpected error {other:?}"),
            }
        }

        #[test]
        fn ignore_list_matches_any_pattern() {
            let list = IgnoreList::compile(["^Archive/", "\\.draft\\.md$"]).unwrap();
            assert!(list.is_ignored("Archive/Old.md"));
            assert!(list.is_ignored("Soups/Pho.draft.md"));
            assert!(!list.is_ignored("Soups/Pho.md"));
        }
    }
}

pub mod storage {
    //! Where meal plan notes live. Every edit is one whole-document read-modify-write.

    use anyhow::{Context, Result, anyhow};
    use log::debug;
    use std::collections::HashMap;
    use std::ffi::OsString;
    use std::fs;
    use std::io::ErrorKind;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    pub trait DocumentStore {
        /// Current text of the document, or `None` when it does not exist.
        fn read_document(&self, path: &Path) -> Result<Option<String>>;

        /// Applies `edit` to the current text (empty when absent) and stores the result.
        /// Nothing is written when the text comes back unchanged.
        fn modify_document(
            &self,
            path: &Path,
            edit: &mut dyn FnMut(&str) -> Result<String>,
        ) -> Result<()>;
    }

    /// Notes on the local filesystem.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct FsDocumentStore;

    impl DocumentStore for FsDocumentStore {
        fn read_document(&self, path: &Path) -> Result<Option<String>> {
            match fs::read_to_string(path) {
                Ok(text) => Ok(Some(text)),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
                Err(err) => Err(err).with_context(|| format!("reading {:?}", path)),
            }
        }

        fn modify_document(
            &self,
            path: &Path,
            edit: &mut dyn FnMut(&str) -> Result<String>,
        ) -> Result<()> {
            let current = self.read_document(path)?.unwrap_or_default();
            let updated = edit(&current)?;
            if updated == current {
                debug!("{:?} unchanged", path);
                return Ok(());
            }
            write_replacing(path, &updated)
        }
    }

    /// Writes a sibling temp file and renames it over `path`, so a failed write
    /// leaves the previous text in place.
    fn write_replacing(path: &Path, text: &str) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| format!("creating {:?}", parent))?;
        }
        let mut tmp = OsString::from(path.as_os_str());
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, text.as_bytes()).with_context(|| format!("writing {:?}", tmp))?;
        if let Err(err) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(err).with_context(|| format!("replacing {:?}", path));
        }
        debug!("wrote {:?}", path);
        Ok(())
    }

    /// In-memory notes, keyed by path. Edits are serialized by the lock.
    #[derive(Debug, Default)]
    pub struct MemoryDocumentStore {
        documents: Mutex<HashMap<PathBuf, String>>,
    }

    impl MemoryDocumentStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, path: impl Into<PathBuf>, text: impl Into<String>) -> Result<()> {
            self.lock()?.insert(path.into(), text.into());
            Ok(())
        }

        fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<PathBuf, String>>> {
            self.documents
                .lock()
                .map_err(|_| anyhow!("document store lock poisoned"))
        }
    }

    impl DocumentStore for MemoryDocumentStore {
        fn read_document(&self, path: &Path) -> Result<Option<String>> {
            Ok(self.lock()?.get(path).cloned())
        }

        fn modify_document(
            &self,
            path: &Path,
            edit: &mut dyn FnMut(&str) -> Result<String>,
        ) -> Result<()> {
            let mut documents = self.lock()?;
            let current = documents.get(path).cloned().unwrap_or_default();
            let updated = edit(&current)?;
            if updated != current {
                documents.insert(path.to_path_buf(), updated);
            }
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn fs_store_creates_and_replaces_documents() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("vault").join("Meal Plan.md");
            let store = FsDocumentStore;

            assert_eq!(store.read_document(&path).expect("read absent"), None);
            store
                .modify_document(&path, &mut |text: &str| Ok(format!("{text}first\n")))
                .expect("create");
            store
                .modify_document(&path, &mut |text: &str| Ok(format!("{text}second\n")))
                .expect("append");
            assert_eq!(
                store.read_document(&path).expect("read"),
                Some("first\nsecond\n".to_string())
            );
            assert!(!tmp.path().join("vault").join("Meal Plan.md.tmp").exists());
        }

        #[test]
        fn fs_store_skips_no_op_and_failed_edits() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("note.md");
            let store = FsDocumentStore;

            store
                .modify_document(&path, &mut |text: &str| Ok(text.to_string()))
                .expect("no-op");
            assert!(!path.exists());

            fs::write(&path, "keep me").expect("seed");
            let result = store.modify_document(&path, &mut |_: &str| Err::<String, _>(anyhow!("boom")));
            assert!(result.is_err());
            assert_eq!(fs::read_to_string(&path).expect("read"), "keep me");
        }

        #[test]
        fn memory_store_round_trips() {
            let store = MemoryDocumentStore::new();
            let path = Path::new("Meal Plan.md");
            store.insert(path, "a").expect("insert");
            store
                .modify_document(path, &mut |text: &str| Ok(format!("{text}b")))
                .expect("modify");
            assert_eq!(store.read_document(path).expect("read"), Some("ab".into()));
            assert_eq!(store.read_document(Path::new("other.md")).expect("read"), None);
        }
    }
}

pub mod planner {
    //! Meal plan operations bound to settings, a document store and a clock.

    use crate::convert;
    use crate::core::{DomainError, Format, Week};
    use crate::layout::open_layout;
    use crate::ops;
    use crate::settings::Settings;
    use crate::storage::DocumentStore;
    use anyhow::{Context, Result};
    use chrono::{Local, NaiveDate};
    use std::path::PathBuf;

    pub struct MealPlanner<S> {
        settings: Settings,
        store: S,
        today: fn() -> NaiveDate,
    }

    fn local_today() -> NaiveDate {
        Local::now().date_naive()
    }

    impl<S: DocumentStore> MealPlanner<S> {
        pub fn new(settings: Settings, store: S) -> Self {
            Self::with_clock(settings, store, local_today)
        }

        pub fn with_clock(settings: Settings, store: S, today: fn() -> NaiveDate) -> Self {
            Self {
                settings,
                store,
                today,
            }
        }

        pub fn settings(&self) -> &Settings {
            &self.settings
        }

        pub fn store(&self) -> &S {
            &self.store
        }

        pub fn meal_plan_path(&self) -> PathBuf {
            self.settings.meal_plan_path()
        }

        /// Adds `recipe` to `day` of the current week.
        pub fn add_recipe_to_meal_plan(&self, recipe: &str, day: &str) -> Result<()> {
            let today = (self.today)();
            self.edit(|content| {
                ops::add_recipe_to_current_week(content, &self.settings, today, recipe, day)
            })
        }

        /// Adds `recipe` to `day` of the week containing `date`.
        pub fn add_recipe_to_meal_plan_by_date(
            &self,
            recipe: &str,
            date: NaiveDate,
            day: &str,
        ) -> Result<()> {
            self.edit(|content| ops::add_recipe_by_date(content, &self.settings, date, recipe, day))
        }

        /// Removes `recipe` from the day and week of `date`.
        pub fn remove_recipe_from_meal_plan(&self, recipe: &str, date: NaiveDate) -> Result<()> {
            self.edit(|content| ops::remove_recipe_by_date(content, &self.settings, date, recipe))
        }

        /// Weeks in the note, in document order. A missing note has none.
        pub fn read_meal_plan(&self) -> Result<Vec<Week>> {
            let path = self.meal_plan_path();
            let headers = self.settings.day_headers()?;
            let content = self
                .store
                .read_document(&path)
                .with_context(|| format!("reading meal plan {:?}", path))?;
            Ok(content
                .and_then(|text| open_layout(&text, &headers).map(|layout| layout.weeks()))
                .unwrap_or_default())
        }

        /// Rewrites the note in `target` layout.
        pub fn convert_meal_plan(&self, target: Format) -> Result<()> {
            let headers = self.settings.day_headers()?;
            self.edit(|content| Ok(convert::convert(content, target, &headers)))
        }

        fn edit(&self, op: impl Fn(&str) -> Result<String, DomainError>) -> Result<()> {
            let path = self.meal_plan_path();
            self.store
                .modify_document(&path, &mut |content: &str| -> Result<String> { Ok(op(content)?) })
                .with_context(|| format!("updating meal plan {:?}", path))
        }
    }

}

pub use convert::{convert, convert_list_to_table, convert_table_to_list};
pub use detect::detect_format;
pub use planner::MealPlanner;
pub use table::{add_recipe_to_table, create_table_week_row};
