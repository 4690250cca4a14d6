//! Folding community reaction summaries into reaction records.

use std::collections::BTreeMap;

use courier_common::AppResult;
use courier_core::{
    CommunityReaction, ConversationId, ConversationStore, MessageId, ReactionRecord,
};

/// Most reactors stored per emoji, including the local user.
const MAX_REACTORS: usize = 5;

/// Who the local user is, for picking their own reaction out of a summary.
#[derive(Debug, Clone, Copy)]
pub struct ReactorIdentity<'a> {
    pub account_id: Option<&'a str>,
    pub blinded_ids: &'a [String],
}

impl ReactorIdentity<'_> {
    fn is_self(&self, reactor: &str) -> bool {
        self.account_id == Some(reactor) || self.blinded_ids.iter().any(|id| id == reactor)
    }
}

/// Build the records for every emoji of one community message.
///
/// Per emoji: the first other reactor carries the total count (excluding
/// the local user), a few more reactors follow with a count of zero, and the
/// local user's own reaction comes last with a count of one.
#[must_use]
pub fn build_reaction_records(
    message_id: MessageId,
    server_id: i64,
    reactions: &BTreeMap<String, CommunityReaction>,
    identity: ReactorIdentity<'_>,
) -> Vec<ReactionRecord> {
    let mut records = Vec::new();
    for (emoji, reaction) in reactions {
        let add_self = reaction.you
            || identity
                .account_id
                .is_some_and(|me| reaction.reactors.iter().any(|r| r == me));
        let others: Vec<&String> = reaction
            .reactors
            .iter()
            .filter(|r| !identity.is_self(r))
            .collect();
        let count = if reaction.you {
            reaction.count.saturating_sub(1)
        } else {
            reaction.count
        };

        let record = |author: &str, n: u64| ReactionRecord {
            message_id,
            author: author.to_string(),
            emoji: emoji.clone(),
            server_id: server_id.to_string(),
            count: n,
            sort_id: reaction.index,
        };

        let limit = (if add_self { MAX_REACTORS - 1 } else { MAX_REACTORS }).min(others.len());
        for (i, reactor) in others.iter().take(limit.max(1)).enumerate() {
            records.push(record(reactor.as_str(), if i == 0 { count } else { 0 }));
        }

        if let (true, Some(me)) = (add_self, identity.account_id) {
            records.push(record(me, 1));
        }
    }
    records
}

/// Resolve the local message for `server_id` and add its reaction records
/// to `out`. Does nothing if the message is not stored locally.
pub async fn collect_reactions(
    conversations: &dyn ConversationStore,
    conversation: ConversationId,
    server_id: i64,
    reactions: Option<&BTreeMap<String, CommunityReaction>>,
    identity: ReactorIdentity<'_>,
    out: &mut BTreeMap<MessageId, Vec<ReactionRecord>>,
) -> AppResult<()> {
    let Some(reactions) = reactions.filter(|r| !r.is_empty()) else {
        return Ok(());
    };
    let Some(message_id) = conversations
        .message_id_for_server_id(conversation, server_id)
        .await?
    else {
        return Ok(());
    };

    out.entry(message_id)
        .or_default()
        .extend(build_reaction_records(message_id, server_id, reactions, identity));
    Ok(())
}

#[cfg(test)]
mod tests {
    use maplit::btreemap;

    use super::*;

    fn reaction(count: u64, reactors: &[&str], you: bool) -> CommunityReaction {
        CommunityReaction {
            count,
            reactors: reactors.iter().map(ToString::to_string).collect(),
            you,
            index: 2,
        }
    }

    fn identity<'a>(blinded: &'a [String]) -> ReactorIdentity<'a> {
        ReactorIdentity {
            account_id: Some("05me"),
            blinded_ids: blinded,
        }
    }

    fn summary(records: &[ReactionRecord]) -> Vec<(&str, u64)> {
        records.iter().map(|r| (r.author.as_str(), r.count)).collect()
    }

    #[test]
    fn test_first_reactor_carries_count() {
        let reactions = btreemap! {
            "👍".to_string() => reaction(12, &["a", "b", "c", "d", "e", "f"], false),
        };
        let records = build_reaction_records(MessageId(7), 99, &reactions, identity(&[]));

        assert_eq!(
            summary(&records),
            vec![("a", 12), ("b", 0), ("c", 0), ("d", 0), ("e", 0)]
        );
        assert!(records.iter().all(|r| r.server_id == "99" && r.sort_id == 2));
    }

    #[test]
    fn test_own_reaction_goes_last() {
        let blinded = vec!["15me".to_string()];
        let reactions = btreemap! {
            "❤️".to_string() => reaction(6, &["15me", "a", "b", "c", "d", "e"], true),
        };
        let records = build_reaction_records(MessageId(7), 99, &reactions, identity(&blinded));

        assert_eq!(
            summary(&records),
            vec![("a", 5), ("b", 0), ("c", 0), ("d", 0), ("05me", 1)]
        );
    }

    #[test]
    fn test_only_self_reacted() {
        let reactions = btreemap! {
            "🎉".to_string() => reaction(1, &["05me"], true),
        };
        let records = build_reaction_records(MessageId(1), 5, &reactions, identity(&[]));

        assert_eq!(summary(&records), vec![("05me", 1)]);
    }
}
