use burn::prelude::*;
use burn::tensor::activation::log_softmax;

use crate::env::Observation;
use crate::error::{AgentError, Result};

use super::state::InstanceState;

/// Oracle target for one instance at one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeacherLabel {
    /// Move to the candidate at this index.
    Candidate(usize),
    /// Stop; the index is the stop slot (the number of candidates).
    Stop(usize),
    /// Instance already stopped; excluded from the imitation loss.
    Ignore,
}

impl TeacherLabel {
    /// Index into `[candidates + stop]`, or `ignore_id`.
    pub fn target(self, ignore_id: i64) -> i64 {
        match self {
            TeacherLabel::Candidate(index) | TeacherLabel::Stop(index) => index as i64,
            TeacherLabel::Ignore => ignore_id,
        }
    }
}

pub fn teacher_label(ob: &Observation, state: InstanceState) -> Result<TeacherLabel> {
    if state.is_stopped() {
        return Ok(TeacherLabel::Ignore);
    }
    if let Some(index) = ob
        .candidates
        .iter()
        .position(|candidate| candidate.viewpoint_id == ob.teacher)
    {
        return Ok(TeacherLabel::Candidate(index));
    }
    if ob.teacher == ob.viewpoint {
        return Ok(TeacherLabel::Stop(ob.candidates.len()));
    }
    Err(AgentError::TeacherMismatch {
        instr_id: ob.instr_id.clone(),
        teacher: ob.teacher.clone(),
        viewpoint: ob.viewpoint.clone(),
    })
}

pub fn teacher_labels(obs: &[Observation], states: &[InstanceState]) -> Result<Vec<TeacherLabel>> {
    obs.iter()
        .zip(states)
        .map(|(ob, &state)| teacher_label(ob, state))
        .collect()
}

/// Summed cross-entropy of masked logits against the labels.
///
/// Rows whose target is `ignore_id` add nothing to the loss.
pub fn imitation_loss<B: Backend>(
    masked_logits: Tensor<B, 2>,
    labels: &[TeacherLabel],
    stop_slots: &[usize],
    ignore_id: i64,
) -> Tensor<B, 1> {
    let device = masked_logits.device();
    let [batch, _] = masked_logits.dims();

    let targets: Vec<i64> = labels.iter().map(|label| label.target(ignore_id)).collect();
    let ignored: Vec<bool> = targets.iter().map(|&target| target == ignore_id).collect();
    // Ignored rows gather from their always-valid stop slot and are zeroed afterwards
    let gather_index: Vec<i64> = targets
        .iter()
        .zip(stop_slots)
        .map(|(&target, &stop)| if target == ignore_id { stop as i64 } else { target })
        .collect();

    let gather_index =
        Tensor::<B, 2, Int>::from_data(TensorData::new(gather_index, [batch, 1]), &device);
    let ignored = Tensor::<B, 1, Bool>::from_data(TensorData::new(ignored, [batch]), &device);

    let picked = log_softmax(masked_logits, 1)
        .gather(1, gather_index)
        .reshape([batch])
        .mask_fill(ignored, 0.0);
    picked.sum().neg()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::features::tests::observation;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn with_teacher(teacher: &str) -> Observation {
        let mut ob = observation("i", &[1, 0], 2);
        ob.candidates[0].viewpoint_id = "A".to_string();
        ob.candidates[1].viewpoint_id = "B".to_string();
        ob.viewpoint = "C".to_string();
        ob.teacher = teacher.to_string();
        ob
    }

    #[test]
    fn test_teacher_picks_matching_candidate() {
        let label = teacher_label(&with_teacher("B"), InstanceState::Active).unwrap();
        assert_eq!(label, TeacherLabel::Candidate(1));
        assert_eq!(label.target(-100), 1);
    }

    #[test]
    fn test_teacher_at_goal_picks_stop_slot() {
        let label = teacher_label(&with_teacher("C"), InstanceState::Active).unwrap();
        assert_eq!(label, TeacherLabel::Stop(2));
        assert_eq!(label.target(-100), 2);
    }

    #[test]
    fn test_unreachable_teacher_is_fatal() {
        assert!(matches!(
            teacher_label(&with_teacher("Z"), InstanceState::Active),
            Err(AgentError::TeacherMismatch { .. })
        ));
    }

    #[test]
    fn test_stopped_instances_are_ignored() {
        let label = teacher_label(&with_teacher("Z"), InstanceState::Stopped).unwrap();
        assert_eq!(label, TeacherLabel::Ignore);
        assert_eq!(label.target(-100), -100);
    }

    #[test]
    fn test_imitation_loss_skips_ignored_rows() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_data(
            TensorData::new(vec![0.0f32, 0.0, f32::NEG_INFINITY, 5.0, 1.0, 2.0], [2, 3]),
            &device,
        );
        let loss = imitation_loss(
            logits,
            &[TeacherLabel::Candidate(1), TeacherLabel::Ignore],
            &[1, 2],
            -100,
        );
        let value = loss.into_scalar();
        assert!((value - 2.0f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_imitation_loss_uses_configured_ignore_id() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_data(
            TensorData::new(vec![3.0f32, 3.0, 0.0, 0.0], [2, 2]),
            &device,
        );
        let labels = [TeacherLabel::Stop(1), TeacherLabel::Ignore];

        // Only the first row counts, whatever the sentinel value
        let expected = 2.0f32.ln();
        for ignore_id in [-100, -1] {
            let loss = imitation_loss(logits.clone(), &labels, &[1, 1], ignore_id).into_scalar();
            assert!((loss - expected).abs() < 1e-5);
        }
    }
}
