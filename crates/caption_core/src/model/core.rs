//! RnnCore - Stacked recurrent language core (LSTM or GRU)

use candle_core::{Result, Tensor};
use candle_nn::rnn::{gru, lstm, GRUConfig, GRUState, LSTMConfig, LSTMState, GRU, LSTM, RNN};
use candle_nn::{Dropout, VarBuilder};

use super::RnnType;

pub enum RnnCore {
    Lstm(Vec<LSTM>),
    Gru(Vec<GRU>),
}

/// Per-layer hidden state
#[derive(Clone)]
pub enum CoreState {
    Lstm(Vec<LSTMState>),
    Gru(Vec<GRUState>),
}

impl RnnCore {
    pub fn load(
        rnn_type: RnnType,
        input_size: usize,
        hidden_size: usize,
        num_layers: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let in_dim = |layer: usize| if layer == 0 { input_size } else { hidden_size };
        match rnn_type {
            RnnType::Lstm => (0..num_layers)
                .map(|l| lstm(in_dim(l), hidden_size, LSTMConfig::default(), vb.pp(l)))
                .collect::<Result<Vec<_>>>()
                .map(RnnCore::Lstm),
            RnnType::Gru => (0..num_layers)
                .map(|l| gru(in_dim(l), hidden_size, GRUConfig::default(), vb.pp(l)))
                .collect::<Result<Vec<_>>>()
                .map(RnnCore::Gru),
        }
    }

    pub fn zero_state(&self, batch: usize) -> Result<CoreState> {
        match self {
            RnnCore::Lstm(layers) => layers
                .iter()
                .map(|l| l.zero_state(batch))
                .collect::<Result<Vec<_>>>()
                .map(CoreState::Lstm),
            RnnCore::Gru(layers) => layers
                .iter()
                .map(|l| l.zero_state(batch))
                .collect::<Result<Vec<_>>>()
                .map(CoreState::Gru),
        }
    }

    /// Advance every layer by one step. Returns the top layer output and the new state.
    /// Dropout is applied between stacked layers in training mode.
    pub fn step(
        &self,
        xt: &Tensor,
        state: &CoreState,
        dropout: &Dropout,
        train: bool,
    ) -> Result<(Tensor, CoreState)> {
        let mut input = xt.clone();
        match (self, state) {
            (RnnCore::Lstm(layers), CoreState::Lstm(states)) => {
                let mut next = Vec::with_capacity(layers.len());
                for (i, (layer, s)) in layers.iter().zip(states).enumerate() {
                    if i > 0 {
                        input = dropout.forward(&input, train)?;
                    }
                    let new_state = layer.step(&input, s)?;
                    input = new_state.h().clone();
                    next.push(new_state);
                }
                Ok((input, CoreState::Lstm(next)))
            }
            (RnnCore::Gru(layers), CoreState::Gru(states)) => {
                let mut next = Vec::with_capacity(layers.len());
                for (i, (layer, s)) in layers.iter().zip(states).enumerate() {
                    if i > 0 {
                        input = dropout.forward(&input, train)?;
                    }
                    let new_state = layer.step(&input, s)?;
                    input = new_state.h().clone();
                    next.push(new_state);
                }
                Ok((input, CoreState::Gru(next)))
            }
            _ => candle_core::bail!("RnnCore: state does not match cell type"),
        }
    }
}
