//! Demo cast and furniture for headless runs

use std::f64::consts::TAU;
use std::sync::atomic::{AtomicUsize, Ordering};
use workshop_common::Position;
use workshop_core::{Behavior, ElementKind, SimulationContext, WorkshopElement};

/// (agent id, display name, behavior)
pub const ROSTER: &[(&str, &str, Behavior)] = &[
    ("ada", "Ada", Behavior::Wander),
    ("bo", "Bo", Behavior::Patrol),
    ("cy", "Cy", Behavior::Stationary),
    ("dee", "Dee", Behavior::Wander),
    ("eli", "Eli", Behavior::Patrol),
    ("fay", "Fay", Behavior::Stationary),
];

const RING_RADIUS: f64 = 90.0;

/// Place up to `count` agents in a ring around the center and furnish the room.
/// Returns the placed instance ids in roster order.
pub fn seed_workshop(ctx: &mut SimulationContext, count: usize) -> Vec<String> {
    let count = count.clamp(1, ROSTER.len());
    let center = Position::new(400.0, 300.0);

    let mut placed = Vec::with_capacity(count);
    for (i, (agent_id, name, behavior)) in ROSTER.iter().take(count).enumerate() {
        let angle = TAU * i as f64 / count as f64;
        let position = center.offset(RING_RADIUS * angle.cos(), RING_RADIUS * angle.sin());
        ctx.upsert_profile(agent_id, name);
        placed.push(ctx.place_agent(agent_id, position, *behavior));
    }
    for pair in placed.windows(2) {
        ctx.add_relationship(&pair[0], &pair[1], "teammates");
    }

    let board = ctx.add_element(WorkshopElement::new(
        ElementKind::Pinboard,
        "Ideas",
        center.offset(0.0, -160.0),
    ));
    ctx.add_pin(&board, "ada", "Try a shorter standup");
    ctx.add_pin(&board, "bo", "Write the release notes early");

    let notices = ctx.add_element(WorkshopElement::new(
        ElementKind::Messageboard,
        "Notices",
        center.offset(180.0, 0.0),
    ));
    ctx.set_element_content(&notices, "Demo on Friday. Coffee machine is fixed.");

    let rules = ctx.add_element(WorkshopElement::new(
        ElementKind::Rulebook,
        "House rules",
        center.offset(-180.0, 0.0),
    ));
    ctx.set_element_content(&rules, "Be kind. Ship small. Leave notes for others.");

    let mut inbox = WorkshopElement::new(ElementKind::Inbox, "Ada's inbox", center.offset(0.0, 160.0));
    inbox.set_owner("ada");
    let inbox = ctx.add_element(inbox);
    ctx.deliver_message(&inbox, "bo", "Release", "Can you review the checklist?");

    placed
}

const SMALL_TALK: &[&str] = &[
    "Has anyone looked at the pinboard today?",
    "I think we can cut the scope and still make Friday.",
    "Good point. Let me write that down.",
    "The notices say the demo is on Friday, so we should hurry.",
    "I'd rather ship something small than nothing at all.",
    "Agreed, let's pair on it after lunch.",
];

/// Canned replies keyed off the kind of prompt received
pub fn scripted_reply(counter: &AtomicUsize, prompt: &str) -> Option<String> {
    if prompt.starts_with("Summarize this conversation") {
        return Some("Context: agreed to ship a small demo on Friday.".to_string());
    }
    if prompt.contains("You walk up to this") {
        return Some("Noted. Worth keeping in mind for Friday.".to_string());
    }
    if prompt.contains("final turn") {
        return Some("To sum up: small scope, notes first, demo Friday.".to_string());
    }
    let i = counter.fetch_add(1, Ordering::Relaxed);
    Some(SMALL_TALK[i % SMALL_TALK.len()].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use workshop_common::WorkshopSettings;

    #[test]
    fn test_seed_workshop_clamps_and_furnishes() {
        let mut ctx = SimulationContext::headless(WorkshopSettings::default());
        let placed = seed_workshop(&mut ctx, 99);
        assert_eq!(placed.len(), ROSTER.len());
        assert_eq!(ctx.relationships().len(), ROSTER.len() - 1);
        assert_eq!(ctx.elements().count(), 4);
        assert_eq!(ctx.display_name("ada"), "Ada");
    }

    #[test]
    fn test_scripted_reply_by_prompt_kind() {
        let counter = AtomicUsize::new(0);
        assert!(
            scripted_reply(&counter, "Summarize this conversation so far")
                .unwrap()
                .starts_with("Context:")
        );
        assert_eq!(scripted_reply(&counter, "hello").as_deref(), Some(SMALL_TALK[0]));
        assert_eq!(scripted_reply(&counter, "hello").as_deref(), Some(SMALL_TALK[1]));
    }
}
