use super::val::Val;
use crate::lang::ast::VarType;
use crate::lang::Error;
use std::collections::HashMap;

type Result<T> = std::result::Result<T, Error>;

/// ## Variable memory
///
/// Scalars and arrays live in separate spaces; `a` and `a(1)` never
/// collide. Reads auto-initialize to the type's zero without inserting.

#[derive(Debug, Default)]
pub struct Var {
    scalars: HashMap<String, Val>,
    arrays: HashMap<String, Array>,
}

#[derive(Debug)]
struct Array {
    dimensions: Vec<i32>,
    data: Vec<Val>,
    var_type: VarType,
}

impl Var {
    pub fn new() -> Var {
        let mut var = Var::default();
        var.scalars.insert("err%".to_string(), Val::Integer(0));
        var.scalars.insert("erl%".to_string(), Val::Integer(0));
        var
    }

    /// Drops everything except the `ERR%`/`ERL%` system variables.
    pub fn clear(&mut self) {
        let err = self.fetch("err%", VarType::Integer);
        let erl = self.fetch("erl%", VarType::Integer);
        self.scalars.clear();
        self.arrays.clear();
        self.scalars.insert("err%".to_string(), err);
        self.scalars.insert("erl%".to_string(), erl);
    }

    pub fn fetch(&self, name: &str, var_type: VarType) -> Val {
        match self.scalars.get(name) {
            Some(val) => val.clone(),
            None => Val::default_for(var_type),
        }
    }

    pub fn store(&mut self, name: &str, var_type: VarType, value: Val) -> Result<()> {
        let value = value.coerce_to(var_type)?;
        self.scalars.insert(name.to_string(), value);
        Ok(())
    }

    pub fn has(&self, name: &str) -> bool {
        self.scalars.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Val> {
        self.scalars.remove(name)
    }

    pub fn dimension(
        &mut self,
        name: &str,
        dimensions: Vec<i32>,
        var_type: VarType,
        base: i32,
    ) -> Result<()> {
        if self.arrays.contains_key(name) {
            return Err(error!(DuplicateDefinition));
        }
        let mut total: usize = 1;
        for dim in &dimensions {
            let extent = dim + 1 - base;
            if extent <= 0 {
                return Err(error!(SubscriptOutOfRange));
            }
            total = total.saturating_mul(extent as usize);
        }
        if total > 1 << 24 {
            return Err(error!(OutOfMemory));
        }
        self.arrays.insert(
            name.to_string(),
            Array {
                dimensions,
                data: vec![Val::default_for(var_type); total],
                var_type,
            },
        );
        Ok(())
    }

    pub fn erase(&mut self, name: &str) {
        self.arrays.remove(name);
    }

    pub fn has_array(&self, name: &str) -> bool {
        self.arrays.contains_key(name)
    }

    pub fn fetch_element(
        &mut self,
        name: &str,
        indices: &[i32],
        var_type: VarType,
        base: i32,
    ) -> Result<Val> {
        self.auto_dimension(name, indices.len(), var_type, base)?;
        let array = match self.arrays.get(name) {
            Some(a) => a,
            None => return Err(error!(InternalError; "MISSING ARRAY")),
        };
        let index = flat_index(array, indices, base)?;
        Ok(array.data[index].clone())
    }

    pub fn store_element(
        &mut self,
        name: &str,
        indices: &[i32],
        value: Val,
        var_type: VarType,
        base: i32,
    ) -> Result<()> {
        self.auto_dimension(name, indices.len(), var_type, base)?;
        let array = match self.arrays.get_mut(name) {
            Some(a) => a,
            None => return Err(error!(InternalError; "MISSING ARRAY")),
        };
        let index = flat_index(array, indices, base)?;
        array.data[index] = value.coerce_to(array.var_type)?;
        Ok(())
    }

    /// A first subscripted reference with no prior DIM dimensions every
    /// axis to an upper bound of 10.
    fn auto_dimension(
        &mut self,
        name: &str,
        rank: usize,
        var_type: VarType,
        base: i32,
    ) -> Result<()> {
        if !self.arrays.contains_key(name) {
            self.dimension(name, vec![10; rank], var_type, base)?;
        }
        Ok(())
    }
}

fn flat_index(array: &Array, indices: &[i32], base: i32) -> Result<usize> {
    if indices.len() != array.dimensions.len() {
        return Err(error!(SubscriptOutOfRange));
    }
    let mut index: usize = 0;
    let mut multiplier: usize = 1;
    for i in (0..indices.len()).rev() {
        let offset = indices[i] - base;
        let extent = array.dimensions[i] + 1 - base;
        if offset < 0 || offset >= extent {
            return Err(error!(SubscriptOutOfRange));
        }
        index += offset as usize * multiplier;
        multiplier *= extent as usize;
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_initialize() {
        let var = Var::new();
        assert_eq!(var.fetch("a", VarType::Single), Val::Single(0.0));
        assert_eq!(var.fetch("a$", VarType::String), Val::String(String::new()));
    }

    #[test]
    fn test_store_coerces() {
        let mut var = Var::new();
        var.store("n%", VarType::Integer, Val::Double(2.7)).unwrap();
        assert_eq!(var.fetch("n%", VarType::Integer), Val::Integer(3));
    }

    #[test]
    fn test_duplicate_definition() {
        let mut var = Var::new();
        var.dimension("a", vec![5], VarType::Single, 0).unwrap();
        let err = var.dimension("a", vec![5], VarType::Single, 0).unwrap_err();
        assert_eq!(err.code(), 10);
    }

    #[test]
    fn test_auto_dimension_to_ten() {
        let mut var = Var::new();
        var.store_element("a", &[10], Val::Double(1.0), VarType::Single, 0)
            .unwrap();
        let err = var
            .fetch_element("a", &[11], VarType::Single, 0)
            .unwrap_err();
        assert_eq!(err.code(), 9);
    }

    #[test]
    fn test_option_base_one() {
        let mut var = Var::new();
        var.dimension("a", vec![3, 3], VarType::Integer, 1).unwrap();
        var.store_element("a", &[1, 1], Val::Double(5.0), VarType::Integer, 1)
            .unwrap();
        var.store_element("a", &[3, 3], Val::Double(9.0), VarType::Integer, 1)
            .unwrap();
        assert!(var
            .store_element("a", &[0, 1], Val::Double(1.0), VarType::Integer, 1)
            .is_err());
        assert_eq!(
            var.fetch_element("a", &[3, 3], VarType::Integer, 1).unwrap(),
            Val::Integer(9)
        );
    }

    #[test]
    fn test_scalar_and_array_are_distinct() {
        let mut var = Var::new();
        var.store("a", VarType::Single, Val::Double(1.0)).unwrap();
        var.store_element("a", &[0], Val::Double(2.0), VarType::Single, 0)
            .unwrap();
        assert_eq!(var.fetch("a", VarType::Single), Val::Single(1.0));
    }
}
