//! Per-path operation compaction.
//!
//! A raw submission sequence usually carries redundancy: repeated scalar
//! assigns, many small series logs, modifications that a later delete makes
//! irrelevant. Each path gets one accumulator that reduces its operations to
//! a minimal equivalent sequence while enforcing that the declared value kind
//! stays stable until a `DeleteAttribute` resets it.

use crate::error::Error;
use crate::operation::{AttributeKind, OpPayload, Operation};
use std::collections::BTreeMap;

/// Compacted operations partitioned by execution phase, in lexicographic
/// path order.
#[derive(Debug, Default)]
pub struct AccumulatedOperations {
    pub upload_operations: Vec<Operation>,
    pub artifact_operations: Vec<Operation>,
    pub other_operations: Vec<Operation>,
    pub errors: Vec<Error>,
}

impl AccumulatedOperations {
    pub fn is_empty(&self) -> bool {
        self.upload_operations.is_empty()
            && self.artifact_operations.is_empty()
            && self.other_operations.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct OperationsPreprocessor {
    accumulators: BTreeMap<String, PathState>,
    processed_count: usize,
}

impl OperationsPreprocessor {
    pub fn new() -> Self {
        OperationsPreprocessor::default()
    }

    /// Feeds operations into the per-path accumulators in submission order.
    /// Returns the unconsumed tail: a file or artifact operation arriving at
    /// a path with a queued delete must wait until queued operations have
    /// been synchronized, so consumption stops there and the caller resubmits
    /// the remainder after a flush.
    pub fn process(&mut self, operations: Vec<Operation>) -> Vec<Operation> {
        let mut iter = operations.into_iter();
        while let Some(op) = iter.next() {
            let state = self
                .accumulators
                .entry(op.path.to_string())
                .or_insert_with(PathState::new);
            match state.visit(op) {
                Visit::Consumed => self.processed_count += 1,
                Visit::Stalled(op) => {
                    let mut remainder = vec![op];
                    remainder.extend(iter);
                    return remainder;
                }
            }
        }
        Vec::new()
    }

    /// Operations consumed so far across all `process` calls.
    pub fn processed_count(&self) -> usize {
        self.processed_count
    }

    /// Emits the compacted operations, lexicographically by path string.
    pub fn accumulate(self) -> AccumulatedOperations {
        let mut result = AccumulatedOperations::default();
        for (_, state) in self.accumulators {
            for op in state.into_operations(&mut result.errors) {
                if op.payload.is_artifact_tracking_op() {
                    result.artifact_operations.push(op);
                } else if op.payload.is_upload_op() {
                    result.upload_operations.push(op);
                } else {
                    result.other_operations.push(op);
                }
            }
        }
        result
    }
}

enum Visit {
    Consumed,
    /// The operation could not be accepted yet; it is handed back untouched.
    Stalled(Operation),
}

/// How an incoming operation folds into the queued modify list.
enum Modifier {
    /// Last value wins.
    Replace,
    /// Order-sensitive incremental op, kept as-is.
    Append,
    /// Wipes everything queued for this kind.
    Clear,
    /// Concatenate consecutive series logs; a queued clear is preserved in
    /// front, so at most `[Clear, MergedLog]` survive.
    MergeLog,
    /// Concatenate tracked artifact entries into one operation.
    MergeEntries,
}

#[derive(Debug)]
struct PathState {
    declared_kind: Option<AttributeKind>,
    delete_ops: Vec<Operation>,
    modify_ops: Vec<Operation>,
    config_ops: Vec<Operation>,
    errors: Vec<Error>,
}

impl PathState {
    fn new() -> Self {
        PathState {
            declared_kind: None,
            delete_ops: Vec::new(),
            modify_ops: Vec::new(),
            config_ops: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn into_operations(mut self, errors: &mut Vec<Error>) -> Vec<Operation> {
        errors.append(&mut self.errors);
        let mut ops = self.delete_ops;
        ops.append(&mut self.modify_ops);
        ops.append(&mut self.config_ops);
        ops
    }

    fn visit(&mut self, op: Operation) -> Visit {
        match &op.payload {
            OpPayload::DeleteAttribute => {
                self.visit_delete(op);
                Visit::Consumed
            }
            OpPayload::ConfigFloatSeries { .. } => {
                self.visit_config(AttributeKind::FloatSeries, op)
            }
            payload => {
                let kind = match payload.required_kind() {
                    Some(kind) => kind,
                    // required_kind is None only for DeleteAttribute.
                    None => return Visit::Consumed,
                };
                let modifier = match payload {
                    OpPayload::AssignFloat(_)
                    | OpPayload::AssignInt(_)
                    | OpPayload::AssignBool(_)
                    | OpPayload::AssignString(_)
                    | OpPayload::AssignDatetime(_)
                    | OpPayload::AssignArtifact { .. }
                    | OpPayload::UploadFile { .. }
                    | OpPayload::UploadFileContent { .. }
                    | OpPayload::UploadFileSet { reset: true, .. } => Modifier::Replace,
                    OpPayload::UploadFileSet { reset: false, .. }
                    | OpPayload::AddStrings(_)
                    | OpPayload::RemoveStrings(_)
                    | OpPayload::DeleteFiles(_) => Modifier::Append,
                    OpPayload::LogFloats(_)
                    | OpPayload::LogStrings(_)
                    | OpPayload::LogImages(_) => Modifier::MergeLog,
                    OpPayload::ClearFloatSeries
                    | OpPayload::ClearStringSeries
                    | OpPayload::ClearImageSeries
                    | OpPayload::ClearStringSet => Modifier::Clear,
                    OpPayload::TrackFilesToArtifact { .. } => Modifier::MergeEntries,
                    OpPayload::ConfigFloatSeries { .. } | OpPayload::DeleteAttribute => {
                        unreachable!("handled above")
                    }
                };
                self.visit_modify(kind, op, modifier)
            }
        }
    }

    fn kind_mismatch(&mut self, expected: AttributeKind, op: &Operation) {
        self.errors.push(Error::MetadataInconsistency(format!(
            "Cannot perform {} operation on {}: Attribute is not a {}",
            op.payload.name(),
            op.path,
            expected.as_str(),
        )));
    }

    /// File and artifact operations cannot be queued behind a delete: their
    /// side effects happen on specialized endpoints before the batched RPC,
    /// so the delete must reach the server first.
    fn stalls_behind_delete(&self, op: &Operation) -> bool {
        (op.payload.is_upload_op() || op.payload.is_artifact_tracking_op())
            && !self.delete_ops.is_empty()
    }

    fn visit_modify(&mut self, expected: AttributeKind, op: Operation, modifier: Modifier) -> Visit {
        if self.declared_kind.is_some_and(|kind| kind != expected) {
            self.kind_mismatch(expected, &op);
            return Visit::Consumed;
        }
        if self.stalls_behind_delete(&op) {
            return Visit::Stalled(op);
        }
        self.declared_kind = Some(expected);
        match modifier {
            Modifier::Replace | Modifier::Clear => self.modify_ops = vec![op],
            Modifier::Append => self.modify_ops.push(op),
            Modifier::MergeLog => self.merge_log(op),
            Modifier::MergeEntries => self.merge_entries(op),
        }
        Visit::Consumed
    }

    fn visit_config(&mut self, expected: AttributeKind, op: Operation) -> Visit {
        if self.declared_kind.is_some_and(|kind| kind != expected) {
            self.kind_mismatch(expected, &op);
            return Visit::Consumed;
        }
        self.declared_kind = Some(expected);
        self.config_ops = vec![op];
        Visit::Consumed
    }

    fn merge_log(&mut self, op: Operation) {
        // A queued clear stays in front; a trailing log absorbs the new one.
        if self.modify_ops.last().map(is_series_log) == Some(true) {
            if let Some(prev) = self.modify_ops.pop() {
                self.modify_ops.push(combine_logs(prev, op));
                return;
            }
        }
        self.modify_ops.push(op);
    }

    fn merge_entries(&mut self, op: Operation) {
        match self.modify_ops.pop() {
            None => self.modify_ops.push(op),
            Some(prev) => {
                let merged = match (prev.payload, op.payload) {
                    (
                        OpPayload::TrackFilesToArtifact {
                            project_id,
                            mut entries,
                        },
                        OpPayload::TrackFilesToArtifact {
                            entries: new_entries,
                            ..
                        },
                    ) => {
                        entries.extend(new_entries);
                        OpPayload::TrackFilesToArtifact { project_id, entries }
                    }
                    // declared_kind already guarantees both are tracking ops
                    (_, payload) => payload,
                };
                self.modify_ops.push(Operation::new(op.path, merged));
            }
        }
    }

    fn visit_delete(&mut self, op: Operation) {
        if self.declared_kind.is_some() {
            if self.delete_ops.is_empty() {
                // Modifications are queued but no delete is. The attribute
                // may not exist remotely yet, so a lone delete could fail:
                // keep the first queued modification in front to guarantee
                // the attribute exists before it is deleted.
                let mut kept = Vec::new();
                if let Some(first) = self.modify_ops.first().cloned() {
                    kept.push(first);
                }
                kept.push(op);
                self.delete_ops = kept;
            }
            // A delete is already queued: dropping everything after it is
            // equivalent to deleting again.
            self.modify_ops.clear();
            self.config_ops.clear();
            self.declared_kind = None;
        } else if self.delete_ops.is_empty() {
            self.delete_ops.push(op);
        }
        // A repeated delete with nothing in between is a no-op.
    }
}

fn is_series_log(op: &Operation) -> bool {
    matches!(
        op.payload,
        OpPayload::LogFloats(_) | OpPayload::LogStrings(_) | OpPayload::LogImages(_)
    )
}

fn combine_logs(prev: Operation, next: Operation) -> Operation {
    let payload = match (prev.payload, next.payload) {
        (OpPayload::LogFloats(mut a), OpPayload::LogFloats(b)) => {
            a.extend(b);
            OpPayload::LogFloats(a)
        }
        (OpPayload::LogStrings(mut a), OpPayload::LogStrings(b)) => {
            a.extend(b);
            OpPayload::LogStrings(a)
        }
        (OpPayload::LogImages(mut a), OpPayload::LogImages(b)) => {
            a.extend(b);
            OpPayload::LogImages(a)
        }
        // declared_kind keeps log variants homogeneous per path
        (_, payload) => payload,
    };
    Operation::new(next.path, payload)
}
