use std::fs;
use std::path::Path;

use serde::{ Serialize, Deserialize };

use crate::{
  error::{ Error, Result },
  shape::Shape,
  tensor::Tensor,
};

use super::{ Graph, NodeId };


#[derive(Serialize, Deserialize)]
struct VariableDump {
  name: String,
  shape: Shape,
  values: Vec<f32>,
}

#[derive(Serialize, Deserialize)]
struct Checkpoint {
  variables: Vec<VariableDump>,
}


impl Graph {
  /// Encode the values of all variables, keyed by node name.

  pub fn dump_variables(&self) -> Result<Vec<u8>> {
    let variables = self.variables().into_iter()
      .map(|id| {
        let node = self.node(id);
        VariableDump {
          name: node.name.clone(),
          shape: node.output.shape(),
          values: node.output.to_vec(),
        }
      })
      .collect();
    Ok(postcard::to_allocvec(&Checkpoint { variables })?)
  }

  /// Assign variables from a [dump](Self::dump_variables).
  ///
  /// Nothing gets assigned unless every entry names a variable of
  /// the same shape.

  pub fn restore_variables(&mut self, bytes: &[u8]) -> Result<()> {
    let checkpoint: Checkpoint = postcard::from_bytes(bytes)?;
    let mut assignments: Vec<(NodeId, VariableDump)> = vec![];
    for dump in checkpoint.variables {
      let id = self.find(&dump.name)
        .filter(|&id| self.node(id).is_variable() )
        .ok_or_else(|| Error::UnknownVariable(dump.name.clone()) )?;
      let expected = self.node(id).shape;
      if dump.shape != expected || dump.values.len() != expected.size() {
        return Err(Error::ShapeMismatch { name: dump.name, expected, got: dump.shape })
      }
      assignments.push((id, dump));
    }
    for (id, dump) in assignments {
      self.assign(id, &Tensor::from_vec(dump.shape, dump.values));
    }
    Ok(())
  }

  pub fn save_variables(&self, path: impl AsRef<Path>) -> Result<()> {
    let bytes = self.dump_variables()?;
    fs::write(path, bytes)?;
    Ok(())
  }

  pub fn load_variables(&mut self, path: impl AsRef<Path>) -> Result<()> {
    let bytes = fs::read(path)?;
    self.restore_variables(&bytes)
  }
}
