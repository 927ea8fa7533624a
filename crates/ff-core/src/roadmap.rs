//! Roadmap ingestion: turns a `ROADMAP.md` checklist into a dependency-ordered
//! batch of pending tasks.
//!
//! ```text
//! ## Phase 1: Core Data (Target: Q3)
//! - [ ] Build projections API
//!   - [ ] endpoint returns weekly projections
//! - [ ] Player data ETL
//! ```
//!
//! Every task of phase `N` depends on every task of phase `N - 1`; phase 0 is
//! the bootstrap phase and has no dependencies.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::types::{Role, Task, TaskId};

static PHASE_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^##\s+Phase\s+(\d+):\s*([^(]+?)\s*(?:\(Target:\s*([^)]*)\))?\s*$")
        .expect("phase heading regex")
});
static TOP_LEVEL_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^- \[( |x|X)\]\s+(.+?)\s*$").expect("item regex"));
static NESTED_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s{2,}- \[( |x|X)\]\s+(.+?)\s*$").expect("nested item regex"));

/// Title/description keywords mapped to the role that should pick the task up.
const ROLE_KEYWORDS: &[(&str, Role)] = &[
    ("backend", Role::Backend),
    ("api", Role::Backend),
    ("database", Role::Backend),
    ("frontend", Role::Frontend),
    ("ui", Role::Frontend),
    ("data", Role::Data),
    ("model", Role::Data),
    ("prediction", Role::Data),
    ("devops", Role::DevOps),
    ("deployment", Role::DevOps),
    ("docker", Role::DevOps),
    ("test", Role::Qa),
    ("quality", Role::Qa),
    ("architecture", Role::TechLead),
    ("design", Role::TechLead),
];

static KEYWORD_PATTERNS: LazyLock<Vec<(Regex, Role)>> = LazyLock::new(|| {
    ROLE_KEYWORDS
        .iter()
        .map(|(kw, role)| {
            let re = Regex::new(&format!(r"\b{}\b", regex::escape(kw))).expect("keyword regex");
            (re, *role)
        })
        .collect()
});

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoadmapError {
    #[error("roadmap contains no `## Phase N: Name` sections")]
    NoPhases,
    #[error("phase {0} appears more than once")]
    DuplicatePhase(u32),
    #[error("line {line}: task item outside of any phase")]
    OrphanItem { line: usize },
    #[error("line {line}: invalid phase number: {detail}")]
    BadPhase { line: usize, detail: String },
}

/// A parsed phase section before it is turned into tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    pub number: u32,
    pub name: String,
    pub target: Option<String>,
    pub items: Vec<Item>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub title: String,
    pub subtasks: Vec<String>,
}

/// Split the markdown into phases and their open checklist items.
///
/// Checked top-level items (`- [x]`) are already done and are skipped along
/// with their nested items.
pub fn parse_phases(text: &str) -> Result<Vec<Phase>, RoadmapError> {
    let mut phases: Vec<Phase> = Vec::new();
    let mut skipping = false;

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        if let Some(caps) = PHASE_HEADING.captures(line) {
            let number: u32 = caps[1].parse().map_err(|e: std::num::ParseIntError| {
                RoadmapError::BadPhase {
                    line: line_no,
                    detail: e.to_string(),
                }
            })?;
            if phases.iter().any(|p| p.number == number) {
                return Err(RoadmapError::DuplicatePhase(number));
            }
            phases.push(Phase {
                number,
                name: caps[2].trim().to_string(),
                target: caps
                    .get(3)
                    .map(|m| m.as_str().trim().to_string())
                    .filter(|s| !s.is_empty()),
                items: Vec::new(),
            });
            skipping = false;
            continue;
        }
        if let Some(caps) = TOP_LEVEL_ITEM.captures(line) {
            let phase = phases
                .last_mut()
                .ok_or(RoadmapError::OrphanItem { line: line_no })?;
            skipping = &caps[1] != " ";
            if !skipping {
                phase.items.push(Item {
                    title: caps[2].to_string(),
                    subtasks: Vec::new(),
                });
            }
            continue;
        }
        if let Some(caps) = NESTED_ITEM.captures(line) {
            if skipping {
                continue;
            }
            if let Some(item) = phases.last_mut().and_then(|p| p.items.last_mut()) {
                item.subtasks.push(caps[2].to_string());
            }
        }
    }

    if phases.is_empty() {
        return Err(RoadmapError::NoPhases);
    }
    Ok(phases)
}

/// Parse a roadmap into pending tasks with phase-to-phase dependencies.
pub fn parse_roadmap(text: &str) -> Result<Vec<Task>, RoadmapError> {
    let phases = parse_phases(text)?;

    let mut by_phase: BTreeMap<u32, Vec<TaskId>> = BTreeMap::new();
    let mut tasks = Vec::new();
    for phase in &phases {
        let ids = by_phase.entry(phase.number).or_default();
        for (i, item) in phase.items.iter().enumerate() {
            let index = i + 1;
            let id = TaskId::new(format!("p{}-{:02}-{}", phase.number, index, slug(&item.title)));
            ids.push(id.clone());

            let description = describe(item);
            let role = infer_role(&item.title, &description);
            let criteria = if item.subtasks.is_empty() {
                vec![format!("Implement {} successfully", item.title)]
            } else {
                item.subtasks.clone()
            };
            tasks.push(
                Task::new(id, item.title.clone(), role)
                    .with_description(description)
                    .with_criteria(criteria)
                    .with_phase(phase.number, format!("P{}. {}", phase.number, phase.name))
                    .with_priority(index as i32),
            );
        }
    }

    for task in &mut tasks {
        if task.phase == 0 {
            continue;
        }
        if let Some(prev) = by_phase.get(&(task.phase - 1)) {
            task.dependencies = prev.iter().cloned().collect();
        }
    }
    Ok(tasks)
}

fn describe(item: &Item) -> String {
    let mut description = format!("Implement {}.", item.title);
    if !item.subtasks.is_empty() {
        description.push_str("\n\nThis task includes the following subtasks:\n");
        for sub in &item.subtasks {
            description.push_str("- ");
            description.push_str(sub);
            description.push('\n');
        }
    }
    description
}

/// Role with the most keyword hits in the title and description; the tech
/// lead picks up anything that matches nothing.
pub fn infer_role(title: &str, description: &str) -> Role {
    let text = format!("{title} {description}").to_lowercase();
    let mut hits: BTreeMap<Role, usize> = BTreeMap::new();
    for (re, role) in KEYWORD_PATTERNS.iter() {
        let n = re.find_iter(&text).count();
        if n > 0 {
            *hits.entry(*role).or_default() += n;
        }
    }
    // Ties go to the role declared first in `Role`.
    hits.into_iter()
        .fold(None, |best: Option<(Role, usize)>, (role, n)| match best {
            Some((_, m)) if m >= n => best,
            _ => Some((role, n)),
        })
        .map(|(role, _)| role)
        .unwrap_or(Role::TechLead)
}

fn slug(title: &str) -> String {
    let mut out = String::new();
    let mut dash = false;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            if dash && !out.is_empty() {
                out.push('-');
            }
            out.push(c.to_ascii_lowercase());
            dash = false;
        } else {
            dash = true;
        }
        if out.len() >= 40 {
            break;
        }
    }
    if out.is_empty() {
        out.push_str("task");
    }
    out
}
