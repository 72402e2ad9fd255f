use crate::config::RunConfig;

/// Which actions to attempt for one item. Fields are independent; any
/// combination, including none, is possible.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionDecision {
    pub favorite: bool,
    pub comment: bool,
    pub reply: bool,
}

/// Draws exactly three values, in favorite, comment, reply order, so a
/// scripted draw sequence maps onto items predictably.
pub fn decide(config: &RunConfig, draw: &mut dyn FnMut() -> f64) -> ActionDecision {
    let favorite = draw() < config.favorite_probability;
    let comment = draw() < config.comment_probability;
    let reply = draw() < config.reply_probability;
    ActionDecision {
        favorite,
        comment,
        reply,
    }
}
