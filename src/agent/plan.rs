//! Plan state: an ordered list of plan items with a status machine, updated
//! from LLM output and rendered into the next state message.

use serde::{Deserialize, Serialize};

use crate::agent::views::AgentOutput;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanItemStatus {
    Pending,
    Current,
    Done,
    Skipped,
}

impl PlanItemStatus {
    /// `[x]` done, `[>]` current, `[ ]` pending, `[-]` skipped
    pub fn marker(&self) -> &'static str {
        match self {
            PlanItemStatus::Done => "[x]",
            PlanItemStatus::Current => "[>]",
            PlanItemStatus::Pending => "[ ]",
            PlanItemStatus::Skipped => "[-]",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanItem {
    pub text: String,
    pub status: PlanItemStatus,
}

/// Ordered plan. Invariant: at most one item is `Current`; when the plan is
/// non-empty and any item is not `Done`, exactly one `Current` exists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub items: Vec<PlanItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_index: Option<usize>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn all_done(&self) -> bool {
        !self.items.is_empty()
            && self
                .items
                .iter()
                .all(|i| matches!(i.status, PlanItemStatus::Done | PlanItemStatus::Skipped))
    }

    /// Replace the whole plan; the first item becomes current
    pub fn replace(&mut self, texts: Vec<String>) {
        self.items = texts
            .into_iter()
            .map(|text| PlanItem {
                text,
                status: PlanItemStatus::Pending,
            })
            .collect();
        if let Some(first) = self.items.first_mut() {
            first.status = PlanItemStatus::Current;
            self.current_index = Some(0);
        } else {
            self.current_index = None;
        }
    }

    /// Advance the cursor to `index`. Items between the old and the new
    /// cursor are marked done; the new item becomes current.
    pub fn advance_to(&mut self, index: usize) {
        if self.items.is_empty() {
            return;
        }
        let index = index.min(self.items.len() - 1);
        let old = self.current_index.unwrap_or(0);
        if index < old {
            // Cursor never moves backwards; the model occasionally reports a
            // stale item number.
            return;
        }
        for i in old..index {
            self.items[i].status = PlanItemStatus::Done;
        }
        for (i, item) in self.items.iter_mut().enumerate() {
            if item.status == PlanItemStatus::Current && i != index {
                item.status = PlanItemStatus::Done;
            }
        }
        self.items[index].status = PlanItemStatus::Current;
        self.current_index = Some(index);
    }

    /// Apply a step's model output: `plan_update` replaces the plan,
    /// otherwise `current_plan_item` advances the cursor. Returns whether the
    /// plan was replaced.
    pub fn update_from_output(&mut self, output: &AgentOutput) -> bool {
        if let Some(update) = &output.plan_update {
            self.replace(update.clone());
            return true;
        }
        if let Some(index) = output.current_plan_item {
            self.advance_to(index as usize);
        }
        false
    }

    /// Multi-line rendering with status markers
    pub fn render(&self) -> String {
        self.items
            .iter()
            .map(|item| format!("{} {}", item.status.marker(), item.text))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[cfg(test)]
    fn current_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| i.status == PlanItemStatus::Current)
            .count()
    }
}
