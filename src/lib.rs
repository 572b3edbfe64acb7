use std::collections::HashMap;
use std::path::{Component, Path, PathBuf, MAIN_SEPARATOR};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use swc_core::{
    common::{SyntaxContext, DUMMY_SP},
    ecma::{
        ast::*,
        visit::{VisitMut, VisitMutWith},
    },
    plugin::{
        metadata::TransformPluginMetadataContextKind, plugin_transform,
        proxies::TransformPluginProgramMetadata,
    },
};
use thiserror::Error;

// -----------------------------------------------------------------------------
// Errors
// -----------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("react-transform configuration error: {0}")]
    Configuration(String),
    #[error("relative path {0:?} is only allowed when react-transform is installed as a dependency")]
    UnsafeRelativePath(String),
}

// -----------------------------------------------------------------------------
// Configuration
// -----------------------------------------------------------------------------

/// One entry of the `transforms` list. `target` names the module whose default
/// export wraps components; `imports` and `locals` are forwarded to it at
/// module init time.
#[derive(Debug, Clone, Deserialize)]
pub struct TransformTarget {
    #[serde(alias = "transform")]
    pub target: String,
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub locals: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PluginConfig {
    pub transforms: Vec<TransformTarget>,
    pub factory_methods: Vec<String>,
    pub plugin_dir: Option<PathBuf>,
}

impl PluginConfig {
    pub fn from_raw(raw: Option<&str>) -> Result<Self, TransformError> {
        let raw = raw.ok_or_else(|| {
            TransformError::Configuration("missing plugin configuration".into())
        })?;
        let value: serde_json::Value = serde_json::from_str(raw).map_err(|err| {
            TransformError::Configuration(format!("malformed plugin configuration: {err}"))
        })?;

        let transforms = value
            .get("transforms")
            .ok_or_else(|| TransformError::Configuration("`transforms` is required".into()))?;
        if !transforms.is_array() {
            return Err(TransformError::Configuration(
                "`transforms` must be a list of transform targets".into(),
            ));
        }
        let transforms: Vec<TransformTarget> = serde_json::from_value(transforms.clone())
            .map_err(|err| {
                TransformError::Configuration(format!("malformed transform target: {err}"))
            })?;

        let factory_methods = match value.get("factoryMethods") {
            Some(methods) => serde_json::from_value(methods.clone()).map_err(|err| {
                TransformError::Configuration(format!("malformed `factoryMethods`: {err}"))
            })?,
            None => vec!["React.createClass".to_string()],
        };

        let plugin_dir = value
            .get("pluginDir")
            .and_then(|dir| dir.as_str())
            .map(PathBuf::from);

        Ok(Self {
            transforms,
            factory_methods,
            plugin_dir,
        })
    }
}

// -----------------------------------------------------------------------------
// Path resolution
// -----------------------------------------------------------------------------

const DEPENDENCY_DIR: &str = "node_modules";

#[derive(Debug, Clone)]
enum ResolvePolicy {
    /// Relative specifiers are rejected outright.
    Conservative,
    /// Relative specifiers are resolved against `base` and re-relativized
    /// against the consuming file.
    Permissive { base: PathBuf },
}

#[derive(Debug, Clone)]
pub struct PathResolver {
    policy: ResolvePolicy,
}

impl PathResolver {
    /// The policy is fixed at construction: relative specifiers are only
    /// rewritable when the plugin itself lives under a dependency directory,
    /// because only then is its parent-of-parent a stable resolution base.
    pub fn new(plugin_dir: Option<PathBuf>) -> Self {
        let policy = match plugin_dir {
            Some(dir) if dir.components().any(|c| c.as_os_str() == DEPENDENCY_DIR) => {
                let base = normalize_path(&dir.join("..").join(".."));
                ResolvePolicy::Permissive { base }
            }
            _ => ResolvePolicy::Conservative,
        };
        Self { policy }
    }

    pub fn resolve(
        &self,
        specifier: &str,
        consuming_file: &str,
    ) -> Result<String, TransformError> {
        if !specifier.starts_with('.') {
            return Ok(specifier.to_string());
        }
        match &self.policy {
            ResolvePolicy::Conservative => {
                Err(TransformError::UnsafeRelativePath(specifier.to_string()))
            }
            ResolvePolicy::Permissive { base } => {
                let target = normalize_path(&base.join(specifier));
                let from = Path::new(consuming_file)
                    .parent()
                    .map(normalize_path)
                    .unwrap_or_default();
                let rel = relative_path(&target, &from);
                Ok(format!(".{}{}", MAIN_SEPARATOR, rel.display()))
            }
        }
    }
}

/// Lexical normalization only; the filesystem is never consulted.
fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                _ => out.push(".."),
            },
            other => out.push(other),
        }
    }
    out
}

fn relative_path(target: &Path, from: &Path) -> PathBuf {
    let target: Vec<Component> = target.components().collect();
    let from: Vec<Component> = from.components().collect();
    let shared = target
        .iter()
        .zip(from.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut out = PathBuf::new();
    for _ in shared..from.len() {
        out.push("..");
    }
    for comp in &target[shared..] {
        out.push(comp);
    }
    out
}

// A target whose `imports` include the file being transformed would end up
// wrapping its own wrapper. Parent dir + file stem, extension-agnostic and
// case-sensitive.
fn is_same_module(resolved: &str, filename: &str) -> bool {
    let resolved = Path::new(resolved);
    let file = Path::new(filename);
    resolved.parent() == file.parent() && resolved.file_stem() == file.file_stem()
}

// -----------------------------------------------------------------------------
// Component detection
// -----------------------------------------------------------------------------

static NON_IDENT_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9_]+").unwrap());

fn sanitize_display_name(name: &str) -> String {
    NON_IDENT_CHARS.replace_all(name, "").into_owned()
}

fn module_basename(specifier: &str) -> &str {
    specifier.rsplit(['/', '\\']).next().unwrap_or(specifier)
}

fn prop_name_is(key: &PropName, name: &str) -> bool {
    match key {
        PropName::Ident(ident) => ident.sym.as_ref() == name,
        PropName::Str(s) => s.value.as_ref() == name,
        _ => false,
    }
}

/// A class is component-like iff it has a method literally named `render`.
fn is_componentish_class(class: &Class) -> bool {
    class.body.iter().any(|member| match member {
        ClassMember::Method(method) => prop_name_is(&method.key, "render"),
        _ => false,
    })
}

/// Matches one-segment (`createClass`) and two-segment (`React.createClass`)
/// callee patterns; deeper member chains never match.
fn callee_matches_pattern(callee: &Callee, pattern: &str) -> bool {
    let Callee::Expr(expr) = callee else {
        return false;
    };
    match pattern.split_once('.') {
        None => matches!(&**expr, Expr::Ident(id) if id.sym.as_ref() == pattern),
        Some((obj_name, prop_name)) => {
            if prop_name.contains('.') {
                return false;
            }
            let Expr::Member(member) = &**expr else {
                return false;
            };
            let Expr::Ident(obj) = &*member.obj else {
                return false;
            };
            let MemberProp::Ident(prop) = &member.prop else {
                return false;
            };
            obj.sym.as_ref() == obj_name && prop.sym.as_ref() == prop_name
        }
    }
}

fn is_create_class_call(call: &CallExpr, factory_methods: &[String]) -> bool {
    if !factory_methods
        .iter()
        .any(|pattern| callee_matches_pattern(&call.callee, pattern))
    {
        return false;
    }
    match call.args.as_slice() {
        [arg] => arg.spread.is_none() && matches!(&*arg.expr, Expr::Object(_)),
        _ => false,
    }
}

/// Only statically literal `displayName` keys and string values count;
/// computed names degrade to anonymous identity.
fn find_display_name_in_call(call: &CallExpr) -> Option<String> {
    let arg = call.args.first()?;
    let Expr::Object(object) = &*arg.expr else {
        return None;
    };
    for prop in &object.props {
        if let PropOrSpread::Prop(prop) = prop {
            if let Prop::KeyValue(kv) = &**prop {
                if prop_name_is(&kv.key, "displayName") {
                    if let Expr::Lit(Lit::Str(s)) = &*kv.value {
                        return Some(s.value.to_string());
                    }
                }
            }
        }
    }
    None
}

// -----------------------------------------------------------------------------
// Component records
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
struct ComponentDescriptor {
    display_name: Option<String>,
    is_in_function: bool,
}

// A transform target after config-time resolution, with the self-import guard
// already applied (guarded targets never make it into this list).
#[derive(Debug, Clone)]
struct ResolvedTarget {
    target: String,
    imports: Vec<String>,
    locals: Vec<String>,
}

// -----------------------------------------------------------------------------
// AST construction helpers
// -----------------------------------------------------------------------------

fn plain_ident(name: &str) -> Ident {
    Ident::new(name.into(), DUMMY_SP, SyntaxContext::empty())
}

fn str_lit(value: &str) -> Str {
    Str {
        span: DUMMY_SP,
        value: value.into(),
        raw: None,
    }
}

fn key_value(key: &str, value: Expr) -> PropOrSpread {
    PropOrSpread::Prop(Box::new(Prop::KeyValue(KeyValueProp {
        key: PropName::Ident(IdentName::new(key.into(), DUMMY_SP)),
        value: Box::new(value),
    })))
}

fn call_expr(callee: Expr, args: Vec<Expr>) -> Expr {
    Expr::Call(CallExpr {
        span: DUMMY_SP,
        ctxt: SyntaxContext::empty(),
        callee: Callee::Expr(Box::new(callee)),
        args: args
            .into_iter()
            .map(|expr| ExprOrSpread {
                spread: None,
                expr: Box::new(expr),
            })
            .collect(),
        type_args: None,
    })
}

fn array_of(exprs: Vec<Expr>) -> Expr {
    Expr::Array(ArrayLit {
        span: DUMMY_SP,
        elems: exprs
            .into_iter()
            .map(|expr| {
                Some(ExprOrSpread {
                    spread: None,
                    expr: Box::new(expr),
                })
            })
            .collect(),
    })
}

fn const_decl(name: Ident, init: Expr) -> ModuleItem {
    ModuleItem::Stmt(Stmt::Decl(Decl::Var(Box::new(VarDecl {
        span: DUMMY_SP,
        ctxt: SyntaxContext::empty(),
        kind: VarDeclKind::Const,
        declare: false,
        decls: vec![VarDeclarator {
            span: DUMMY_SP,
            name: Pat::Ident(BindingIdent {
                id: name,
                type_ann: None,
            }),
            init: Some(Box::new(init)),
            definite: false,
        }],
    }))))
}

/// Single-statement function body: `(<params>) { return <return_value>; }`.
fn function_with(params: Vec<Ident>, return_value: Expr) -> Function {
    Function {
        params: params
            .into_iter()
            .map(|id| Param {
                span: DUMMY_SP,
                decorators: vec![],
                pat: Pat::Ident(BindingIdent { id, type_ann: None }),
            })
            .collect(),
        decorators: vec![],
        span: DUMMY_SP,
        ctxt: SyntaxContext::empty(),
        body: Some(BlockStmt {
            span: DUMMY_SP,
            ctxt: SyntaxContext::empty(),
            stmts: vec![Stmt::Return(ReturnStmt {
                span: DUMMY_SP,
                arg: Some(Box::new(return_value)),
            })],
        }),
        is_generator: false,
        is_async: false,
        type_params: None,
        return_type: None,
    }
}

fn wrap_decorator(wrapper: &Ident, component_id: &str) -> Decorator {
    Decorator {
        span: DUMMY_SP,
        expr: Box::new(call_expr(
            Expr::Ident(wrapper.clone()),
            vec![Expr::Lit(Lit::Str(str_lit(component_id)))],
        )),
    }
}

// -----------------------------------------------------------------------------
// Transform state
// -----------------------------------------------------------------------------

pub struct ReactTransform {
    filename: String,
    factory_methods: Vec<String>,
    targets: Vec<ResolvedTarget>,

    // Per-file traversal state. One ReactTransform instance per file.
    function_depth: u32,
    records: Vec<(String, ComponentDescriptor)>,
    wrapper_ident: Option<Ident>,
    uid_counter: u32,

    imported: HashMap<String, Ident>,
    import_decls: Vec<ModuleItem>,
}

impl ReactTransform {
    /// Resolution of every configured specifier happens here, up front: it is
    /// a pure function of config + filename, and visitor hooks have no error
    /// channel. Targets that fail the self-import guard are dropped now.
    pub fn new(
        config: &PluginConfig,
        resolver: &PathResolver,
        filename: impl Into<String>,
    ) -> Result<Self, TransformError> {
        let filename = filename.into();
        let mut targets = Vec::with_capacity(config.transforms.len());
        'targets: for record in &config.transforms {
            let mut imports = Vec::with_capacity(record.imports.len());
            for specifier in &record.imports {
                let resolved = resolver.resolve(specifier, &filename)?;
                if is_same_module(&resolved, &filename) {
                    continue 'targets;
                }
                imports.push(resolved);
            }
            targets.push(ResolvedTarget {
                target: resolver.resolve(&record.target, &filename)?,
                imports,
                locals: record.locals.clone(),
            });
        }
        Ok(Self {
            filename,
            factory_methods: config.factory_methods.clone(),
            targets,
            function_depth: 0,
            records: Vec::new(),
            wrapper_ident: None,
            uid_counter: 0,
            imported: HashMap::new(),
            import_decls: Vec::new(),
        })
    }

    // ---------- host capabilities ----------

    fn generate_uid(&mut self, hint: &str) -> Ident {
        self.uid_counter += 1;
        let hint = if hint.is_empty() { "ref" } else { hint };
        Ident::new(
            format!("_{}{}", hint, self.uid_counter).into(),
            DUMMY_SP,
            SyntaxContext::empty(),
        )
    }

    // One import declaration per distinct resolved specifier; later requests
    // reuse the first local binding.
    fn add_import(&mut self, specifier: &str, hint: &str) -> Ident {
        if let Some(local) = self.imported.get(specifier) {
            return local.clone();
        }
        let local = self.generate_uid(hint);
        self.import_decls
            .push(ModuleItem::ModuleDecl(ModuleDecl::Import(ImportDecl {
                span: DUMMY_SP,
                specifiers: vec![ImportSpecifier::Default(ImportDefaultSpecifier {
                    span: DUMMY_SP,
                    local: local.clone(),
                })],
                src: Box::new(str_lit(specifier)),
                type_only: false,
                with: None,
                phase: ImportPhase::Evaluation,
            })));
        self.imported.insert(specifier.to_string(), local.clone());
        local
    }

    // ---------- record tracking ----------

    fn create_record(&mut self, display_name: Option<String>) -> String {
        let sanitized = display_name
            .as_deref()
            .map(sanitize_display_name)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "Unknown".to_string());
        self.uid_counter += 1;
        let id = format!("_component_{}{}", sanitized, self.uid_counter);
        self.records.push((
            id.clone(),
            ComponentDescriptor {
                display_name,
                is_in_function: self.function_depth > 0,
            },
        ));
        id
    }

    fn has_records(&self) -> bool {
        !self.records.is_empty()
    }

    /// Moves the whole batch out; each batch is synthesized at most once.
    fn flush_records(&mut self) -> (Ident, ObjectLit) {
        let records = std::mem::take(&mut self.records);
        let ident = self.generate_uid("components");
        let props = records
            .into_iter()
            .map(|(id, descriptor)| {
                let mut fields = Vec::new();
                if let Some(name) = descriptor.display_name {
                    fields.push(key_value("displayName", Expr::Lit(Lit::Str(str_lit(&name)))));
                }
                if descriptor.is_in_function {
                    fields.push(key_value(
                        "isInFunction",
                        Expr::Lit(Lit::Bool(Bool {
                            span: DUMMY_SP,
                            value: true,
                        })),
                    ));
                }
                key_value(
                    &id,
                    Expr::Object(ObjectLit {
                        span: DUMMY_SP,
                        props: fields,
                    }),
                )
            })
            .collect();
        (
            ident,
            ObjectLit {
                span: DUMMY_SP,
                props,
            },
        )
    }

    // ---------- synthesis ----------

    // import _target from "<target>";
    // const _target2 = _target({ filename, components, locals: [...], imports: [...] });
    fn define_init_transform_call(
        &mut self,
        records_ident: &Ident,
        target: &ResolvedTarget,
    ) -> (Ident, ModuleItem) {
        let hint = {
            let sanitized = sanitize_display_name(module_basename(&target.target));
            if sanitized.is_empty() {
                "transform".to_string()
            } else {
                sanitized
            }
        };
        let transform_fn = self.add_import(&target.target, &hint);
        let locals = target
            .locals
            .iter()
            .map(|name| Expr::Ident(plain_ident(name)))
            .collect();
        let imports = target
            .imports
            .iter()
            .map(|src| Expr::Ident(self.add_import(src, "import")))
            .collect();
        let options = Expr::Object(ObjectLit {
            span: DUMMY_SP,
            props: vec![
                key_value("filename", Expr::Lit(Lit::Str(str_lit(&self.filename)))),
                key_value("components", Expr::Ident(records_ident.clone())),
                key_value("locals", array_of(locals)),
                key_value("imports", array_of(imports)),
            ],
        });
        let bound = self.generate_uid(&hint);
        let decl = const_decl(
            bound.clone(),
            call_expr(Expr::Ident(transform_fn), vec![options]),
        );
        (bound, decl)
    }

    // function _wrapComponent(id) {
    //     return function(Component) {
    //         return tN(...t1(Component, id)..., id);
    //     };
    // }
    // Leftmost configured target is innermost; no targets means identity.
    fn define_wrap_component(&self, wrapper: Ident, init_idents: &[Ident]) -> ModuleItem {
        let id_param = plain_ident("id");
        let component_param = plain_ident("Component");
        let mut threaded = Expr::Ident(component_param.clone());
        for init in init_idents {
            threaded = call_expr(
                Expr::Ident(init.clone()),
                vec![threaded, Expr::Ident(id_param.clone())],
            );
        }
        let inner = Expr::Fn(FnExpr {
            ident: None,
            function: Box::new(function_with(vec![component_param], threaded)),
        });
        ModuleItem::Stmt(Stmt::Decl(Decl::Fn(FnDecl {
            ident: wrapper,
            declare: false,
            function: Box::new(function_with(vec![id_param], inner)),
        })))
    }
}

// -----------------------------------------------------------------------------
// Traversal
// -----------------------------------------------------------------------------

impl VisitMut for ReactTransform {
    fn visit_mut_program(&mut self, program: &mut Program) {
        // Scripts predate ES module imports; leave them untouched.
        if let Program::Module(module) = program {
            module.visit_mut_with(self);
        }
    }

    fn visit_mut_module(&mut self, module: &mut Module) {
        self.wrapper_ident = Some(self.generate_uid("wrapComponent"));
        module.visit_mut_children_with(self);

        if !self.has_records() {
            return;
        }
        let Some(wrapper) = self.wrapper_ident.take() else {
            return;
        };

        let (records_ident, records) = self.flush_records();
        let targets = self.targets.clone();
        let mut init_idents = Vec::with_capacity(targets.len());
        let mut init_decls = Vec::with_capacity(targets.len());
        for target in &targets {
            let (ident, decl) = self.define_init_transform_call(&records_ident, target);
            init_idents.push(ident);
            init_decls.push(decl);
        }

        // Every synthesized declaration precedes its first use: imports, the
        // records object, the init calls (which read it), then the wrapper
        // (which reads the init bindings), then the rewritten original body.
        let mut prelude: Vec<ModuleItem> = Vec::new();
        prelude.append(&mut self.import_decls);
        prelude.push(const_decl(records_ident, Expr::Object(records)));
        prelude.extend(init_decls);
        prelude.push(self.define_wrap_component(wrapper, &init_idents));
        module.body.splice(0..0, prelude);
    }

    fn visit_mut_function(&mut self, n: &mut Function) {
        self.function_depth += 1;
        n.visit_mut_children_with(self);
        self.function_depth -= 1;
    }

    fn visit_mut_arrow_expr(&mut self, n: &mut ArrowExpr) {
        self.function_depth += 1;
        n.visit_mut_children_with(self);
        self.function_depth -= 1;
    }

    fn visit_mut_class_decl(&mut self, n: &mut ClassDecl) {
        n.visit_mut_children_with(self);
        if !is_componentish_class(&n.class) {
            return;
        }
        let Some(wrapper) = self.wrapper_ident.clone() else {
            return;
        };
        let id = self.create_record(Some(n.ident.sym.to_string()));
        n.class.decorators.push(wrap_decorator(&wrapper, &id));
    }

    fn visit_mut_class_expr(&mut self, n: &mut ClassExpr) {
        n.visit_mut_children_with(self);
        if !is_componentish_class(&n.class) {
            return;
        }
        let Some(wrapper) = self.wrapper_ident.clone() else {
            return;
        };
        let display_name = n.ident.as_ref().map(|ident| ident.sym.to_string());
        let id = self.create_record(display_name);
        n.class.decorators.push(wrap_decorator(&wrapper, &id));
    }

    fn visit_mut_expr(&mut self, expr: &mut Expr) {
        expr.visit_mut_children_with(self);
        let display_name = match &*expr {
            Expr::Call(call) if is_create_class_call(call, &self.factory_methods) => {
                find_display_name_in_call(call)
            }
            _ => return,
        };
        let Some(wrapper) = self.wrapper_ident.clone() else {
            return;
        };
        let id = self.create_record(display_name);
        let original = std::mem::replace(expr, Expr::Invalid(Invalid { span: DUMMY_SP }));
        *expr = call_expr(
            call_expr(
                Expr::Ident(wrapper),
                vec![Expr::Lit(Lit::Str(str_lit(&id)))],
            ),
            vec![original],
        );
    }
}

// -----------------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------------

#[plugin_transform]
pub fn process_transform(
    mut program: Program,
    metadata: TransformPluginProgramMetadata,
) -> Program {
    let raw = metadata.get_transform_plugin_config();
    let config = match PluginConfig::from_raw(raw.as_deref()) {
        Ok(config) => config,
        Err(err) => panic!("{err}"),
    };
    let filename = metadata
        .get_context(&TransformPluginMetadataContextKind::Filename)
        .unwrap_or_else(|| "unknown".to_string());

    let resolver = PathResolver::new(config.plugin_dir.clone());
    let mut transform = match ReactTransform::new(&config, &resolver, filename) {
        Ok(transform) => transform,
        Err(err) => panic!("{err}"),
    };
    program.visit_mut_with(&mut transform);
    program
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
