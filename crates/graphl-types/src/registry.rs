//! The type registry: name → [`TypeDescriptor`].
//!
//! Pre-populated with the primitive set and extended with struct
//! declarations, either one at a time through
//! [`TypeRegistry::register_struct`] or in batches read from a compiled
//! module's metadata. Registration is append-only; nothing is ever removed.
//!
//! Every registration runs under a single write lock and commits all or
//! nothing, so readers never observe a half-registered batch.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::descriptor::{FieldDescriptor, TypeDescriptor, PRIMITIVES};
use crate::error::RegistryError;
use crate::Result;

// ══════════════════════════════════════════════════════════════════════════════
// Declarations
// ══════════════════════════════════════════════════════════════════════════════

/// One field of a [`StructDecl`]: the field type is referenced by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub offset: u32,
}

impl FieldDecl {
    pub fn new(name: impl Into<String>, ty: impl Into<String>, offset: u32) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
            offset,
        }
    }
}

/// An unvalidated struct declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructDecl {
    pub name: String,
    pub size: u32,
    #[serde(default)]
    pub fields: Vec<FieldDecl>,
}

impl StructDecl {
    pub fn new(name: impl Into<String>, size: u32) -> Self {
        Self {
            name: name.into(),
            size,
            fields: Vec::new(),
        }
    }

    /// Append a field.
    pub fn field(mut self, name: impl Into<String>, ty: impl Into<String>, offset: u32) -> Self {
        self.fields.push(FieldDecl::new(name, ty, offset));
        self
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// TypeRegistry
// ══════════════════════════════════════════════════════════════════════════════

/// How to treat a declaration whose name is already registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Redeclare {
    Reject,
    /// Accept when the existing struct has exactly the same layout.
    AllowIdentical,
}

/// Mapping from type name to descriptor.
#[derive(Debug)]
pub struct TypeRegistry {
    types: RwLock<BTreeMap<String, Arc<TypeDescriptor>>>,
}

impl TypeRegistry {
    /// A registry holding only the primitive set.
    pub fn new() -> Self {
        let types = PRIMITIVES
            .iter()
            .map(|&(name, size)| (name.to_owned(), Arc::new(TypeDescriptor::primitive(name, size))))
            .collect();
        Self {
            types: RwLock::new(types),
        }
    }

    /// The process-wide registry.
    pub fn global() -> Arc<TypeRegistry> {
        static GLOBAL: OnceLock<Arc<TypeRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(TypeRegistry::new())).clone()
    }

    /// Look up a descriptor by name.
    pub fn lookup(&self, name: &str) -> Result<Arc<TypeDescriptor>> {
        self.get(name).ok_or_else(|| RegistryError::NotFound {
            name: name.to_owned(),
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<TypeDescriptor>> {
        self.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// All registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Size in bytes of `descriptor`.
    pub fn size_of(&self, descriptor: &TypeDescriptor) -> u32 {
        descriptor.size()
    }

    /// Offset of `field` within the struct `descriptor`.
    pub fn offset_of(&self, descriptor: &TypeDescriptor, field: &str) -> Result<u32> {
        descriptor
            .offset_of(field)
            .ok_or_else(|| RegistryError::FieldNotFound {
                type_name: descriptor.name().to_owned(),
                field: field.to_owned(),
            })
    }

    /// Register a single struct.
    ///
    /// Fails with [`RegistryError::Duplicate`] if `name` exists,
    /// [`RegistryError::InvalidLayout`] if the offsets and size are
    /// inconsistent, [`RegistryError::Cyclic`] if a field refers back to
    /// `name`, and [`RegistryError::NotFound`] for an unknown field type.
    pub fn register_struct(
        &self,
        name: impl Into<String>,
        size: u32,
        fields: Vec<FieldDecl>,
    ) -> Result<Arc<TypeDescriptor>> {
        let decl = StructDecl {
            name: name.into(),
            size,
            fields,
        };
        let mut registered = self.register_structs(std::slice::from_ref(&decl))?;
        Ok(registered.remove(0))
    }

    /// Register a batch of structs that may reference each other.
    ///
    /// Declarations are registered in dependency order; a cycle anywhere in
    /// the batch fails the whole batch. Returns descriptors in input order.
    pub fn register_structs(&self, decls: &[StructDecl]) -> Result<Vec<Arc<TypeDescriptor>>> {
        self.register_batch(decls, Redeclare::Reject)
    }

    /// Like [`register_structs`](Self::register_structs), but a declaration
    /// identical to an already registered struct reuses the existing
    /// descriptor. Used when loading module metadata, where several modules
    /// may declare the same shared struct.
    pub fn declare_structs(&self, decls: &[StructDecl]) -> Result<Vec<Arc<TypeDescriptor>>> {
        self.register_batch(decls, Redeclare::AllowIdentical)
    }

    /// Validate `decls` against the registry without registering them.
    ///
    /// Identical re-declarations are accepted as with
    /// [`declare_structs`](Self::declare_structs). The staged structs are
    /// visible through [`StagedStructs::lookup`] until they are handed to
    /// [`commit`](Self::commit).
    pub fn stage_structs(&self, decls: &[StructDecl]) -> Result<StagedStructs> {
        let built = build_batch(&self.read(), decls, Redeclare::AllowIdentical)?;
        Ok(StagedStructs {
            decls: decls.to_vec(),
            built,
        })
    }

    /// Register previously staged structs.
    ///
    /// Validation runs again under the write lock, so a conflicting struct
    /// registered since staging fails with [`RegistryError::Duplicate`].
    pub fn commit(&self, staged: StagedStructs) -> Result<Vec<Arc<TypeDescriptor>>> {
        self.declare_structs(&staged.decls)
    }

    fn register_batch(
        &self,
        decls: &[StructDecl],
        redeclare: Redeclare,
    ) -> Result<Vec<Arc<TypeDescriptor>>> {
        let mut types = self.types.write().unwrap_or_else(PoisonError::into_inner);
        let built = build_batch(&types, decls, redeclare)?;

        let mut out = Vec::with_capacity(decls.len());
        for decl in decls {
            let descriptor = built
                .get(&decl.name)
                .or_else(|| types.get(&decl.name))
                .cloned()
                .ok_or_else(|| RegistryError::NotFound {
                    name: decl.name.clone(),
                })?;
            out.push(descriptor);
        }
        types.extend(built);
        Ok(out)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<TypeDescriptor>>> {
        self.types.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Struct declarations validated against a registry but not yet part of it.
#[derive(Debug, Clone, Default)]
pub struct StagedStructs {
    decls: Vec<StructDecl>,
    built: BTreeMap<String, Arc<TypeDescriptor>>,
}

impl StagedStructs {
    /// Resolve `name` among the staged structs, then in `registry`.
    pub fn lookup(&self, registry: &TypeRegistry, name: &str) -> Result<Arc<TypeDescriptor>> {
        match self.built.get(name) {
            Some(descriptor) => Ok(descriptor.clone()),
            None => registry.lookup(name),
        }
    }

    /// Names of the structs the registry does not hold yet.
    pub fn fresh(&self) -> impl Iterator<Item = &str> {
        self.built.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.decls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Validation helpers
// ══════════════════════════════════════════════════════════════════════════════

/// Validate and build the structs of `decls` that `types` does not hold.
fn build_batch(
    types: &BTreeMap<String, Arc<TypeDescriptor>>,
    decls: &[StructDecl],
    redeclare: Redeclare,
) -> Result<BTreeMap<String, Arc<TypeDescriptor>>> {
    let mut seen = HashSet::new();
    let mut fresh = Vec::new();
    for decl in decls {
        if !seen.insert(decl.name.as_str()) {
            return Err(RegistryError::Duplicate {
                name: decl.name.clone(),
            });
        }
        match types.get(&decl.name) {
            Some(existing)
                if redeclare == Redeclare::AllowIdentical && same_layout(existing, decl) => {}
            Some(_) => {
                return Err(RegistryError::Duplicate {
                    name: decl.name.clone(),
                })
            }
            None => fresh.push(decl),
        }
    }

    let mut built: BTreeMap<String, Arc<TypeDescriptor>> = BTreeMap::new();
    for decl in dependency_order(&fresh)? {
        let descriptor = build_struct(decl, |ty| {
            built.get(ty).or_else(|| types.get(ty)).cloned()
        })?;
        built.insert(decl.name.clone(), Arc::new(descriptor));
    }
    Ok(built)
}

fn same_layout(existing: &TypeDescriptor, decl: &StructDecl) -> bool {
    existing.is_struct()
        && existing.size() == decl.size
        && existing.fields().len() == decl.fields.len()
        && existing.fields().iter().zip(&decl.fields).all(|(have, want)| {
            have.name() == want.name && have.offset() == want.offset && have.ty().name() == want.ty
        })
}

/// Order `decls` so every struct comes after the batch structs it embeds.
fn dependency_order<'a>(decls: &[&'a StructDecl]) -> Result<Vec<&'a StructDecl>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Visiting,
        Done,
    }

    struct Walk<'a> {
        by_name: HashMap<&'a str, &'a StructDecl>,
        marks: HashMap<&'a str, Mark>,
        stack: Vec<&'a str>,
        order: Vec<&'a StructDecl>,
    }

    impl<'a> Walk<'a> {
        fn visit(&mut self, name: &'a str) -> Result<()> {
            match self.marks.get(name) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    let start = self.stack.iter().position(|n| *n == name).unwrap_or(0);
                    let mut path: Vec<String> =
                        self.stack[start..].iter().map(|n| (*n).to_owned()).collect();
                    path.push(name.to_owned());
                    return Err(RegistryError::Cyclic {
                        name: name.to_owned(),
                        path,
                    });
                }
                None => {}
            }
            let Some(&decl) = self.by_name.get(name) else {
                return Ok(());
            };
            self.marks.insert(name, Mark::Visiting);
            self.stack.push(name);
            for field in &decl.fields {
                self.visit(field.ty.as_str())?;
            }
            self.stack.pop();
            self.marks.insert(name, Mark::Done);
            self.order.push(decl);
            Ok(())
        }
    }

    let mut walk = Walk {
        by_name: decls.iter().map(|d| (d.name.as_str(), *d)).collect(),
        marks: HashMap::new(),
        stack: Vec::new(),
        order: Vec::with_capacity(decls.len()),
    };
    for decl in decls {
        walk.visit(decl.name.as_str())?;
    }
    Ok(walk.order)
}

/// Resolve field types and check the layout invariants:
/// fields do not overlap and appear in offset order, every offset lies
/// inside the struct, and the struct is large enough for its last field.
fn build_struct(
    decl: &StructDecl,
    resolve: impl Fn(&str) -> Option<Arc<TypeDescriptor>>,
) -> Result<TypeDescriptor> {
    let invalid = |reason: String| RegistryError::InvalidLayout {
        name: decl.name.clone(),
        reason,
    };

    let mut names = HashSet::new();
    let mut fields = Vec::with_capacity(decl.fields.len());
    let mut prev_end: Option<(u32, &str)> = None;

    for field in &decl.fields {
        let ty = resolve(&field.ty).ok_or_else(|| RegistryError::NotFound {
            name: field.ty.clone(),
        })?;
        if !names.insert(field.name.as_str()) {
            return Err(invalid(format!("duplicate field `{}`", field.name)));
        }
        if ty.size() == 0 {
            return Err(invalid(format!(
                "field `{}` has zero-sized type `{}`",
                field.name,
                ty.name()
            )));
        }
        if let Some((end, prev)) = prev_end {
            if field.offset < end {
                return Err(invalid(format!(
                    "field `{}` at offset {} overlaps `{}` ending at {}",
                    field.name, field.offset, prev, end
                )));
            }
        }
        if field.offset >= decl.size {
            return Err(invalid(format!(
                "field `{}` offset {} is outside size {}",
                field.name, field.offset, decl.size
            )));
        }
        let end = field
            .offset
            .checked_add(ty.size())
            .filter(|end| *end <= decl.size)
            .ok_or_else(|| {
                invalid(format!(
                    "size {} is too small for field `{}` at offset {} ({} bytes)",
                    decl.size,
                    field.name,
                    field.offset,
                    ty.size()
                ))
            })?;
        prev_end = Some((end, field.name.as_str()));
        fields.push(FieldDescriptor::new(field.name.clone(), field.offset, ty));
    }

    Ok(TypeDescriptor::structure(decl.name.clone(), decl.size, fields))
}
