//! Prompt text sent to agent sessions

/// Opening prompt for the first speaker of a task conversation
pub fn initial_prompt(task: &str, speaker: &str, others: &[String], max_turns: u32) -> String {
    format!(
        "You are {speaker}, working in the workshop with {others}.\n\
         Task: {task}\n\n\
         The group has {max_turns} turns in total and speakers take turns in order. \
         Open the discussion with your first thoughts. Keep it to a short paragraph.",
        others = join_names(others),
    )
}

/// Prompt for a middle turn, quoting the previous speaker
pub fn turn_prompt(speaker: &str, previous_speaker: &str, previous_text: &str, turns_remaining: u32) -> String {
    format!(
        "You are {speaker}. {previous_speaker} said:\n\n\"{previous_text}\"\n\n\
         Respond and move the work forward. {remaining}",
        remaining = remaining_note(turns_remaining),
    )
}

/// Prompt for the last turn: wrap up instead of continuing
pub fn final_prompt(speaker: &str, previous_speaker: &str, previous_text: &str) -> String {
    format!(
        "You are {speaker}. {previous_speaker} said:\n\n\"{previous_text}\"\n\n\
         This is the final turn. Summarize what the group concluded and any next steps."
    )
}

/// Single-agent task assignment
pub fn task_prompt(task: &str, speaker: &str) -> String {
    format!(
        "You are {speaker}, working alone at your desk in the workshop.\n\
         Task: {task}\n\nReply with your result in a short paragraph."
    )
}

/// Reopen an interrupted conversation
pub fn resume_prompt(speaker: &str, others: &[String], title: Option<&str>) -> String {
    let topic = title
        .map(|t| format!(" about \"{}\"", t))
        .unwrap_or_default();
    format!(
        "You are {speaker}. Your conversation with {others}{topic} was interrupted when the \
         workshop closed. Pick up where you left off, briefly recapping where things stood.",
        others = join_names(others),
    )
}

/// Opener for an unprompted chat between idle agents
pub fn banter_prompt(speaker: &str, others: &[String]) -> String {
    format!(
        "You are {speaker}, taking a break in the workshop. You notice {others} nearby. \
         Say something casual to them, one or two sentences.",
        others = join_names(others),
    )
}

/// Ask an agent to read an element and report what matters
pub fn read_element_prompt(speaker: &str, description: &str) -> String {
    format!(
        "You are {speaker}. You walk up to this in the workshop:\n\n{description}\n\n\
         In one or two sentences, note what is relevant to you."
    )
}

pub fn compaction_prompt() -> String {
    "Summarize this conversation so far into a compact context note: decisions made, open \
     questions and anything you committed to do. Drop small talk."
        .to_string()
}

fn remaining_note(turns_remaining: u32) -> String {
    match turns_remaining {
        1 => "One turn remains after yours.".to_string(),
        n => format!("{} turns remain after yours.", n),
    }
}

fn join_names(names: &[String]) -> String {
    match names {
        [] => "nobody else".to_string(),
        [one] => one.clone(),
        [init @ .., last] => format!("{} and {}", init.join(", "), last),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_names() {
        assert_eq!(join_names(&[]), "nobody else");
        assert_eq!(join_names(&["Ada".to_string()]), "Ada");
        assert_eq!(
            join_names(&["Ada".to_string(), "Bo".to_string(), "Cy".to_string()]),
            "Ada, Bo and Cy"
        );
    }

    #[test]
    fn test_turn_prompts_quote_previous() {
        let prompt = turn_prompt("Bo", "Ada", "Let's start", 2);
        assert!(prompt.contains("Ada said"));
        assert!(prompt.contains("\"Let's start\""));
        assert!(prompt.contains("2 turns remain"));

        let last = final_prompt("Bo", "Ada", "done?");
        assert!(last.contains("final turn"));
    }
}
